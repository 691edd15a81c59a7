//! Per-user viewport record.

use super::{Entity, FieldKey, UserId};
use kurbo::Vec2;
use serde::{Deserialize, Serialize};

/// Pan offset and scale a user last looked at. One record per user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewportState {
    pub owner: UserId,
    pub offset: Vec2,
    pub scale: f64,
    pub updated_at: i64,
}

impl ViewportState {
    pub fn new(owner: impl Into<UserId>, offset: Vec2, scale: f64) -> Self {
        Self {
            owner: owner.into(),
            offset,
            scale,
            updated_at: 0,
        }
    }

    /// Clamp the scale into `[min, max]` and replace non-finite values.
    pub fn clamped(mut self, min: f64, max: f64) -> Self {
        if !self.scale.is_finite() {
            self.scale = 1.0;
        }
        self.scale = self.scale.clamp(min, max);
        if !self.offset.x.is_finite() {
            self.offset.x = 0.0;
        }
        if !self.offset.y.is_finite() {
            self.offset.y = 0.0;
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ViewportField {
    OffsetX(f64),
    OffsetY(f64),
    Scale(f64),
    UpdatedAt(i64),
}

impl FieldKey for ViewportField {
    fn key(&self) -> &'static str {
        match self {
            ViewportField::OffsetX(_) => "offset_x",
            ViewportField::OffsetY(_) => "offset_y",
            ViewportField::Scale(_) => "scale",
            ViewportField::UpdatedAt(_) => "updated_at",
        }
    }
}

impl Entity for ViewportState {
    type Id = UserId;
    type Field = ViewportField;

    fn blank(owner: UserId) -> Self {
        Self::new(owner, Vec2::ZERO, 1.0)
    }

    fn id(&self) -> UserId {
        self.owner.clone()
    }

    fn apply(&mut self, field: ViewportField) {
        match field {
            ViewportField::OffsetX(x) => self.offset.x = x,
            ViewportField::OffsetY(y) => self.offset.y = y,
            ViewportField::Scale(s) => self.scale = s,
            ViewportField::UpdatedAt(t) => self.updated_at = t,
        }
    }

    fn fields(&self) -> Vec<ViewportField> {
        vec![
            ViewportField::OffsetX(self.offset.x),
            ViewportField::OffsetY(self.offset.y),
            ViewportField::Scale(self.scale),
            ViewportField::UpdatedAt(self.updated_at),
        ]
    }

    fn is_deleted(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamped_scale() {
        let vp = ViewportState::new("u1", Vec2::ZERO, 50.0).clamped(0.1, 10.0);
        assert!((vp.scale - 10.0).abs() < f64::EPSILON);

        let vp = ViewportState::new("u1", Vec2::new(f64::NAN, 3.0), f64::NAN).clamped(0.1, 10.0);
        assert!((vp.scale - 1.0).abs() < f64::EPSILON);
        assert_eq!(vp.offset, Vec2::new(0.0, 3.0));
    }
}
