//! Presence value types: who is looking at which slide, and what they hold
//! selected. These are ephemeral and never written into the deck itself.

use serde::{Deserialize, Serialize};

/// Cursor position on a slide, in slide coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub slide_id: String,
    pub x: f64,
    pub y: f64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionState {
    pub slide_id: String,
    pub component_ids: Vec<String>,
}

/// One actor's broadcast presence on a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceState {
    pub actor_id: String,
    pub display_name: String,
    /// CSS hex color, e.g. `#3d7be0`.
    pub color: String,
    pub cursor: Option<CursorPosition>,
    pub selection: Option<SelectionState>,
    pub last_update: u64,
}

impl PresenceState {
    pub fn new(actor_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        let actor_id = actor_id.into();
        let color = color_for_actor(&actor_id);
        Self {
            actor_id,
            display_name: display_name.into(),
            color,
            cursor: None,
            selection: None,
            last_update: crate::now_millis(),
        }
    }

    /// Slide the actor is currently on, preferring the cursor over the selection.
    pub fn slide_id(&self) -> Option<&str> {
        self.cursor
            .as_ref()
            .map(|c| c.slide_id.as_str())
            .or_else(|| self.selection.as_ref().map(|s| s.slide_id.as_str()))
    }
}

/// Stable, visually distinct color for an actor id.
///
/// The hue comes from an FNV-1a hash of the id; saturation and lightness are
/// fixed so every cursor is equally vivid.
pub fn color_for_actor(actor_id: &str) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in actor_id.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    let hue = (hash % 360) as f32 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_is_stable() {
        assert_eq!(color_for_actor("alice"), color_for_actor("alice"));
        assert_eq!(color_for_actor("alice").len(), 7);
        assert!(color_for_actor("alice").starts_with('#'));
    }

    #[test]
    fn test_hsl_to_rgb_red() {
        let (r, g, b) = hsl_to_rgb(0.0, 1.0, 0.5);
        assert!((r - 1.0).abs() < 0.01);
        assert!(g.abs() < 0.01);
        assert!(b.abs() < 0.01);
    }

    #[test]
    fn test_slide_id_prefers_cursor() {
        let mut state = PresenceState::new("a1", "Alice");
        assert_eq!(state.slide_id(), None);

        state.selection = Some(SelectionState {
            slide_id: "s2".into(),
            component_ids: vec!["c1".into()],
        });
        assert_eq!(state.slide_id(), Some("s2"));

        state.cursor = Some(CursorPosition {
            slide_id: "s1".into(),
            x: 1.0,
            y: 2.0,
            timestamp: 1,
        });
        assert_eq!(state.slide_id(), Some("s1"));
    }
}
