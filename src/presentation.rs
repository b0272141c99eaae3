//! Display and operator-input seams of the session loop.
//!
//! Surfaces use centred pixel coordinates: the origin is the middle of the
//! display and y grows upwards.

use std::io::BufRead;
use std::path::Path;
use std::time::Duration;

use image::{Rgb, RgbImage};
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};

pub type Color = [u8; 3];

pub const BLACK: Color = [0, 0, 0];
pub const GREY: Color = [128, 128, 128];
pub const WHITE: Color = [255, 255, 255];

pub trait PresentationSurface {
    fn size(&self) -> (u32, u32);

    fn clear(&mut self, color: Color);

    fn draw_circle(&mut self, center: (f32, f32), radius: f32, color: Color);

    /// One-pixel outline of an axis-aligned rectangle.
    fn draw_rect(&mut self, center: (f32, f32), size: (f32, f32), color: Color);

    /// One-pixel outline. `semi_axes` are along and across `angle`, in
    /// degrees counter-clockwise from the x axis.
    fn draw_ellipse(&mut self, center: (f32, f32), semi_axes: (f32, f32), angle: f32, color: Color);

    fn draw_text(&mut self, text: &str, position: (f32, f32), color: Color);

    /// Ends the frame.
    fn present(&mut self);
}

/// Off-screen surface rasterising into an RGB image.
///
/// Text is not rasterised, the strings of the current frame are kept
/// instead.
pub struct CanvasSurface {
    image: RgbImage,
    background: Color,
    texts: Vec<String>,
    frames: u64,
}

impl CanvasSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            image: RgbImage::from_pixel(width, height, Rgb(GREY)),
            background: GREY,
            texts: Vec::new(),
            frames: 0,
        }
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn texts(&self) -> &[String] {
        &self.texts
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames
    }

    pub fn background(&self) -> Color {
        self.background
    }

    /// Pixel at centred coordinates, `None` off the canvas.
    pub fn pixel_at(&self, (x, y): (f32, f32)) -> Option<Color> {
        let (px, py) = self.to_image(x, y);
        if px < 0.0 || py < 0.0 {
            return None;
        }
        let (px, py) = (px as u32, py as u32);
        if px >= self.image.width() || py >= self.image.height() {
            return None;
        }
        Some(self.image.get_pixel(px, py).0)
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        self.image.save(path).map_err(std::io::Error::other)?;
        log::info!("Saved display snapshot to {}", path.display());
        Ok(())
    }

    /// Pixel bounds of a box around `center`, clipped to the canvas.
    fn clipped_box(&self, (cx, cy): (f32, f32), (rx, ry): (f32, f32)) -> (u32, u32, u32, u32) {
        let (width, height) = self.image.dimensions();
        let x0 = (cx - rx).floor().max(0.0) as u32;
        let y0 = (cy - ry).floor().max(0.0) as u32;
        let x1 = ((cx + rx).ceil().max(0.0) as u32).min(width);
        let y1 = ((cy + ry).ceil().max(0.0) as u32).min(height);
        (x0, y0, x1, y1)
    }

    fn to_image(&self, x: f32, y: f32) -> (f32, f32) {
        (
            self.image.width() as f32 / 2.0 + x,
            self.image.height() as f32 / 2.0 - y,
        )
    }
}

impl PresentationSurface for CanvasSurface {
    fn size(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    fn clear(&mut self, color: Color) {
        self.background = color;
        self.texts.clear();
        for pixel in self.image.pixels_mut() {
            *pixel = Rgb(color);
        }
    }

    fn draw_circle(&mut self, center: (f32, f32), radius: f32, color: Color) {
        if radius <= 0.0 || !center.0.is_finite() || !center.1.is_finite() {
            return;
        }
        let (cx, cy) = self.to_image(center.0, center.1);
        let (x0, y0, x1, y1) = self.clipped_box((cx, cy), (radius, radius));

        for y in y0..y1 {
            for x in x0..x1 {
                let dx = x as f32 + 0.5 - cx;
                let dy = y as f32 + 0.5 - cy;
                if dx * dx + dy * dy <= radius * radius {
                    self.image.put_pixel(x, y, Rgb(color));
                }
            }
        }
    }

    fn draw_rect(&mut self, center: (f32, f32), size: (f32, f32), color: Color) {
        if size.0 <= 0.0 || size.1 <= 0.0 || !center.0.is_finite() || !center.1.is_finite() {
            return;
        }
        let (cx, cy) = self.to_image(center.0, center.1);
        let (rx, ry) = (size.0 / 2.0, size.1 / 2.0);
        let (x0, y0, x1, y1) = self.clipped_box((cx, cy), (rx, ry));

        for y in y0..y1 {
            for x in x0..x1 {
                let dx = (x as f32 + 0.5 - cx).abs();
                let dy = (y as f32 + 0.5 - cy).abs();
                if dx > rx || dy > ry {
                    continue;
                }
                if rx - dx < 1.0 || ry - dy < 1.0 {
                    self.image.put_pixel(x, y, Rgb(color));
                }
            }
        }
    }

    fn draw_ellipse(&mut self, center: (f32, f32), semi_axes: (f32, f32), angle: f32, color: Color) {
        let (a, b) = semi_axes;
        if a <= 0.0 || b <= 0.0 || !center.0.is_finite() || !center.1.is_finite() {
            return;
        }
        let (cx, cy) = self.to_image(center.0, center.1);
        let reach = a.max(b) + 1.0;
        let (x0, y0, x1, y1) = self.clipped_box((cx, cy), (reach, reach));
        let (sin, cos) = angle.to_radians().sin_cos();

        for y in y0..y1 {
            for x in x0..x1 {
                let dx = x as f32 + 0.5 - cx;
                let dy = cy - (y as f32 + 0.5);
                let u = (dx * cos + dy * sin) / a;
                let v = (dy * cos - dx * sin) / b;
                let r = (u * u + v * v).sqrt();
                if (r - 1.0).abs() * a.min(b) <= 0.75 {
                    self.image.put_pixel(x, y, Rgb(color));
                }
            }
        }
    }

    fn draw_text(&mut self, text: &str, _position: (f32, f32), _color: Color) {
        self.texts.push(text.to_string());
    }

    fn present(&mut self) {
        self.frames += 1;
    }
}

/// The subject-facing and operator-facing displays.
pub struct Displays<'a> {
    pub experiment: &'a mut dyn PresentationSurface,
    pub control: &'a mut dyn PresentationSurface,
}

impl Displays<'_> {
    pub fn for_each(&mut self, mut draw: impl FnMut(&mut dyn PresentationSurface)) {
        draw(&mut *self.experiment);
        draw(&mut *self.control);
    }

    pub fn present(&mut self) {
        self.for_each(|surface| surface.present());
    }
}

/// Non-blocking operator key polling.
pub trait OperatorInput {
    fn poll_key(&mut self) -> Option<char>;
}

impl OperatorInput for mpsc::UnboundedReceiver<char> {
    fn poll_key(&mut self) -> Option<char> {
        self.try_recv().ok()
    }
}

/// Keys typed on stdin, one line at a time.
pub struct StdinKeys {
    keys: mpsc::UnboundedReceiver<char>,
}

impl StdinKeys {
    pub fn spawn() -> Self {
        let (tx, keys) = mpsc::unbounded_channel();
        std::thread::spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                for key in line.trim().chars() {
                    if tx.send(key).is_err() {
                        return;
                    }
                }
            }
            log::debug!("Operator input closed");
        });
        Self { keys }
    }
}

impl OperatorInput for StdinKeys {
    fn poll_key(&mut self) -> Option<char> {
        self.keys.poll_key()
    }
}

/// Paces the render loop.
pub struct FrameClock {
    interval: Interval,
    frame_rate: u32,
}

impl FrameClock {
    pub fn new(frame_rate: u32) -> Self {
        let period = Duration::from_secs_f64(1.0 / frame_rate.max(1) as f64);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self {
            interval,
            frame_rate,
        }
    }

    pub fn frame_rate(&self) -> u32 {
        self.frame_rate
    }

    pub async fn tick(&mut self) {
        self.interval.tick().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circle_lands_at_centred_coordinates() {
        let mut canvas = CanvasSurface::new(200, 100);
        canvas.clear(BLACK);
        canvas.draw_circle((50.0, 25.0), 5.0, WHITE);

        assert_eq!(canvas.pixel_at((50.0, 25.0)), Some(WHITE));
        assert_eq!(canvas.pixel_at((-50.0, 25.0)), Some(BLACK));
        assert_eq!(canvas.pixel_at((50.0, -25.0)), Some(BLACK));
        assert_eq!(canvas.image().get_pixel(150, 25).0, WHITE);
    }

    #[test]
    fn clipped_and_degenerate_circles() {
        let mut canvas = CanvasSurface::new(20, 20);
        canvas.clear(BLACK);
        canvas.draw_circle((500.0, 500.0), 5.0, WHITE);
        canvas.draw_circle((0.0, 0.0), 0.0, WHITE);
        canvas.draw_circle((f32::NAN, 0.0), 5.0, WHITE);
        assert!(canvas.image().pixels().all(|p| p.0 == BLACK));

        canvas.draw_circle((10.0, 10.0), 4.0, WHITE);
        assert_eq!(canvas.image().get_pixel(19, 0).0, WHITE);
    }

    #[test]
    fn outlines_leave_the_inside_untouched() {
        let mut canvas = CanvasSurface::new(200, 100);
        canvas.clear(BLACK);
        canvas.draw_rect((0.0, 0.0), (100.0, 50.0), WHITE);
        assert_eq!(canvas.image().get_pixel(50, 50).0, WHITE);
        assert_eq!(canvas.image().get_pixel(149, 50).0, WHITE);
        assert_eq!(canvas.image().get_pixel(100, 25).0, WHITE);
        assert_eq!(canvas.image().get_pixel(100, 50).0, BLACK);

        canvas.clear(BLACK);
        canvas.draw_ellipse((0.0, 0.0), (40.0, 20.0), 90.0, WHITE);
        assert_eq!(canvas.pixel_at((0.0, 40.0)), Some(WHITE));
        assert_eq!(canvas.pixel_at((20.0, 0.0)), Some(WHITE));
        assert_eq!(canvas.pixel_at((40.0, 0.0)), Some(BLACK));
        assert_eq!(canvas.pixel_at((0.0, 0.0)), Some(BLACK));
    }

    #[test]
    fn channel_input_is_non_blocking() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert_eq!(rx.poll_key(), None);
        tx.send('c').unwrap();
        assert_eq!(rx.poll_key(), Some('c'));
        assert_eq!(rx.poll_key(), None);
    }
}
