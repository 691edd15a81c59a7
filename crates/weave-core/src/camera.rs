//! Camera module for pan/zoom transforms.

use crate::config::EngineConfig;
use crate::model::ViewportState;
use kurbo::{Affine, Point, Rect, Size, Vec2};
use serde::{Deserialize, Serialize};

/// Scale that corresponds to "100%" in the UI.
pub const BASE_SCALE: f64 = 1.0;

/// Which screen point stays fixed while zooming.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ZoomAnchor {
    /// Wheel / pinch: the point under the cursor.
    Cursor(Point),
    /// Keyboard and toolbar zoom.
    ViewportCenter,
}

/// Camera manages the view transform for the canvas.
///
/// World coordinates map to screen coordinates as
/// `screen = world * scale + offset`. Node geometry is always world-space;
/// nothing here ever touches it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Camera {
    /// Current translation offset (pan), in screen pixels
    pub offset: Vec2,
    pub scale: f64,
    pub min_scale: f64,
    pub max_scale: f64,
    /// Size of the on-screen viewport
    pub viewport_size: Size,
    /// Inertial pan velocity in screen pixels per second
    pub velocity: Vec2,
    /// Exponential decay rate of `velocity`, per second
    pub friction: f64,
    /// Below this speed inertial panning stops
    pub settle_velocity: f64,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            offset: Vec2::ZERO,
            scale: BASE_SCALE,
            min_scale: 0.1,
            max_scale: 10.0,
            viewport_size: Size::new(1280.0, 800.0),
            velocity: Vec2::ZERO,
            friction: 6.0,
            settle_velocity: 5.0,
        }
    }
}

impl Camera {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            min_scale: config.min_scale,
            max_scale: config.max_scale,
            friction: config.pan_friction,
            settle_velocity: config.settle_velocity,
            scale: BASE_SCALE.clamp(config.min_scale, config.max_scale),
            ..Self::default()
        }
    }

    /// Get the affine transform for rendering (world to screen).
    pub fn transform(&self) -> Affine {
        Affine::translate(self.offset) * Affine::scale(self.scale)
    }

    /// Get the inverse transform for input handling (screen to world).
    pub fn inverse_transform(&self) -> Affine {
        Affine::scale(1.0 / self.scale) * Affine::translate(-self.offset)
    }

    pub fn screen_to_world(&self, screen_point: Point) -> Point {
        self.inverse_transform() * screen_point
    }

    pub fn world_to_screen(&self, world_point: Point) -> Point {
        self.transform() * world_point
    }

    /// Pan the camera by a delta in screen coordinates. Stops any inertia.
    pub fn pan(&mut self, delta: Vec2) {
        if !delta.is_finite() {
            return;
        }
        self.velocity = Vec2::ZERO;
        self.offset += delta;
    }

    /// Start an inertial pan, e.g. on release of a drag.
    pub fn fling(&mut self, velocity: Vec2) {
        if velocity.is_finite() {
            self.velocity = velocity;
        }
    }

    /// Zoom by `factor` around an anchor. Returns whether the scale changed.
    pub fn zoom(&mut self, factor: f64, anchor: ZoomAnchor) -> bool {
        let point = match anchor {
            ZoomAnchor::Cursor(p) => p,
            ZoomAnchor::ViewportCenter => self.viewport_center(),
        };
        self.zoom_at(point, factor)
    }

    /// Zoom the camera, keeping the given screen point fixed.
    pub fn zoom_at(&mut self, screen_point: Point, factor: f64) -> bool {
        if !factor.is_finite() || factor <= 0.0 {
            return false;
        }
        let new_scale = (self.scale * factor).clamp(self.min_scale, self.max_scale);
        if (new_scale - self.scale).abs() < f64::EPSILON {
            return false;
        }

        let world_point = self.screen_to_world(screen_point);
        self.scale = new_scale;

        // Adjust offset so world_point stays at screen_point
        let new_screen = self.world_to_screen(world_point);
        self.offset += screen_point - new_screen;
        true
    }

    /// Set the scale directly, clamped. Non-finite values are ignored.
    pub fn set_scale(&mut self, scale: f64) {
        if scale.is_finite() {
            self.scale = scale.clamp(self.min_scale, self.max_scale);
        }
    }

    pub fn set_viewport_size(&mut self, size: Size) {
        if size.width.is_finite() && size.height.is_finite() {
            self.viewport_size = Size::new(size.width.max(1.0), size.height.max(1.0));
        }
    }

    pub fn viewport_center(&self) -> Point {
        Point::new(self.viewport_size.width / 2.0, self.viewport_size.height / 2.0)
    }

    /// Advance inertial panning by `dt` seconds. Returns whether the view
    /// moved.
    pub fn update(&mut self, dt: f64) -> bool {
        if self.is_settled() || !dt.is_finite() || dt <= 0.0 {
            return false;
        }
        self.offset += self.velocity * dt;
        self.velocity = self.velocity * (-self.friction * dt).exp();
        if self.velocity.hypot() < self.settle_velocity {
            self.velocity = Vec2::ZERO;
        }
        true
    }

    pub fn is_settled(&self) -> bool {
        self.velocity == Vec2::ZERO
    }

    /// World-space rectangle currently on screen, grown by `padding`
    /// screen pixels on every side.
    pub fn visible_world_rect(&self, padding: f64) -> Rect {
        let screen = Rect::from_origin_size(Point::ZERO, self.viewport_size).inflate(padding, padding);
        let min = self.screen_to_world(Point::new(screen.x0, screen.y0));
        let max = self.screen_to_world(Point::new(screen.x1, screen.y1));
        Rect::from_points(min, max)
    }

    /// Reset camera to default position and scale.
    pub fn reset(&mut self) {
        self.offset = Vec2::ZERO;
        self.scale = BASE_SCALE.clamp(self.min_scale, self.max_scale);
        self.velocity = Vec2::ZERO;
    }

    /// Fit the camera to show the given bounding box.
    pub fn fit_to_bounds(&mut self, bounds: Rect, padding: f64) {
        if bounds.is_zero_area() {
            self.reset();
            return;
        }

        let viewport = self.viewport_size;
        let padded = Size::new(
            (viewport.width - padding * 2.0).max(1.0),
            (viewport.height - padding * 2.0).max(1.0),
        );
        let scale_x = padded.width / bounds.width();
        let scale_y = padded.height / bounds.height();
        self.scale = scale_x.min(scale_y).clamp(self.min_scale, self.max_scale);
        self.velocity = Vec2::ZERO;

        // Center the bounds in the viewport
        let center = bounds.center();
        let viewport_center = self.viewport_center();
        self.offset = Vec2::new(
            viewport_center.x - center.x * self.scale,
            viewport_center.y - center.y * self.scale,
        );
    }

    pub fn to_state(&self, owner: &str) -> ViewportState {
        ViewportState::new(owner, self.offset, self.scale)
    }

    /// Adopt a stored viewport, clamped to this camera's limits.
    pub fn apply_state(&mut self, state: &ViewportState) {
        let state = state.clone().clamped(self.min_scale, self.max_scale);
        self.offset = state.offset;
        self.scale = state.scale;
        self.velocity = Vec2::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_camera() {
        let camera = Camera::new();
        assert_eq!(camera.offset, Vec2::ZERO);
        assert!((camera.scale - BASE_SCALE).abs() < f64::EPSILON);
        assert!(camera.is_settled());
    }

    #[test]
    fn test_screen_to_world_with_offset_and_scale() {
        let mut camera = Camera::new();
        camera.offset = Vec2::new(50.0, 100.0);
        camera.scale = 2.0;
        let world = camera.screen_to_world(Point::new(150.0, 300.0));
        assert!((world.x - 50.0).abs() < f64::EPSILON);
        assert!((world.y - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_roundtrip_conversion() {
        let mut camera = Camera::new();
        camera.offset = Vec2::new(30.0, -20.0);
        camera.scale = 1.5;

        let original = Point::new(123.0, 456.0);
        let back = camera.world_to_screen(camera.screen_to_world(original));
        assert!((back.x - original.x).abs() < 1e-10);
        assert!((back.y - original.y).abs() < 1e-10);
    }

    #[test]
    fn test_zoom_keeps_cursor_fixed() {
        let mut camera = Camera::new();
        camera.offset = Vec2::new(10.0, 10.0);
        let cursor = Point::new(400.0, 300.0);
        let before = camera.screen_to_world(cursor);

        assert!(camera.zoom(1.25, ZoomAnchor::Cursor(cursor)));
        let after = camera.screen_to_world(cursor);
        assert!((before.x - after.x).abs() < 1e-9);
        assert!((before.y - after.y).abs() < 1e-9);
    }

    #[test]
    fn test_keyboard_zoom_keeps_center_fixed() {
        let mut camera = Camera::new();
        camera.set_viewport_size(Size::new(800.0, 600.0));
        let before = camera.screen_to_world(camera.viewport_center());
        camera.zoom(0.5, ZoomAnchor::ViewportCenter);
        let after = camera.screen_to_world(camera.viewport_center());
        assert!((before - after).hypot() < 1e-9);
    }

    #[test]
    fn test_zoom_clamp() {
        let mut camera = Camera::new();
        camera.zoom_at(Point::ZERO, 0.001);
        assert!((camera.scale - camera.min_scale).abs() < f64::EPSILON);

        camera.zoom_at(Point::ZERO, 1e6);
        assert!((camera.scale - camera.max_scale).abs() < f64::EPSILON);
        assert!(!camera.zoom_at(Point::ZERO, 2.0));
    }

    #[test]
    fn test_non_finite_input_ignored() {
        let mut camera = Camera::new();
        camera.set_scale(f64::NAN);
        camera.pan(Vec2::new(f64::INFINITY, 0.0));
        assert!(!camera.zoom_at(Point::ZERO, f64::NAN));
        assert!((camera.scale - BASE_SCALE).abs() < f64::EPSILON);
        assert_eq!(camera.offset, Vec2::ZERO);
    }

    #[test]
    fn test_fling_decays_and_settles() {
        let mut camera = Camera::new();
        camera.fling(Vec2::new(1000.0, 0.0));
        assert!(!camera.is_settled());

        let mut frames = 0;
        while camera.update(1.0 / 60.0) {
            frames += 1;
            assert!(frames < 10_000, "inertia never settled");
        }
        assert!(camera.is_settled());
        assert!(camera.offset.x > 0.0);
        assert!(!camera.update(1.0 / 60.0));
    }

    #[test]
    fn test_visible_rect_tracks_pan_and_scale() {
        let mut camera = Camera::new();
        camera.set_viewport_size(Size::new(800.0, 600.0));
        camera.scale = 2.0;
        camera.offset = Vec2::new(-200.0, -100.0);

        let rect = camera.visible_world_rect(0.0);
        assert!((rect.x0 - 100.0).abs() < 1e-9);
        assert!((rect.y0 - 50.0).abs() < 1e-9);
        assert!((rect.width() - 400.0).abs() < 1e-9);
        assert!((rect.height() - 300.0).abs() < 1e-9);
    }

    #[test]
    fn test_fit_to_bounds_centers() {
        let mut camera = Camera::new();
        camera.set_viewport_size(Size::new(800.0, 600.0));
        camera.fit_to_bounds(Rect::new(0.0, 0.0, 400.0, 300.0), 0.0);
        assert!((camera.scale - 2.0).abs() < 1e-9);
        let center = camera.world_to_screen(Point::new(200.0, 150.0));
        assert!((center.x - 400.0).abs() < 1e-9);
        assert!((center.y - 300.0).abs() < 1e-9);
    }

    #[test]
    fn test_viewport_state_roundtrip_is_clamped() {
        let mut camera = Camera::new();
        camera.apply_state(&ViewportState::new("u1", Vec2::new(5.0, 6.0), 50.0));
        assert!((camera.scale - camera.max_scale).abs() < f64::EPSILON);
        let state = camera.to_state("u1");
        assert_eq!(state.owner, "u1");
        assert_eq!(state.offset, Vec2::new(5.0, 6.0));
    }
}
