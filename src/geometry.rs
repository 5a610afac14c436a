use crate::template::TemplateImage;

/// Long edge of every resolved page, in points (297 mm).
pub const LONG_EDGE_PT: f64 = 841.89;
/// Short edge of the fallback portrait page, in points (210 mm).
pub const FALLBACK_SHORT_EDGE_PT: f64 = 595.28;

/// Resolved output page size in points (1/72 inch).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageGeometry {
    pub width_pt: f64,
    pub height_pt: f64,
}

impl PageGeometry {
    pub const FALLBACK: PageGeometry = PageGeometry {
        width_pt: FALLBACK_SHORT_EDGE_PT,
        height_pt: LONG_EDGE_PT,
    };

    pub fn is_landscape(&self) -> bool {
        self.width_pt > self.height_pt
    }

    pub fn from_template(template: &TemplateImage) -> PageGeometry {
        resolve(
            Some(template.width_px() as f64),
            Some(template.height_px() as f64),
        )
    }

    /// Maps a top-down normalized position onto page points (origin top-left).
    pub fn to_points(&self, x: f64, y: f64) -> (f64, f64) {
        (x * self.width_pt, y * self.height_pt)
    }
}

fn usable(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v > 0.0)
}

/// Page geometry for a template of `width_px` × `height_px`.
///
/// The longer pixel edge maps to exactly [`LONG_EDGE_PT`] and the aspect ratio
/// is preserved. Missing, zero, negative or non-finite input yields
/// [`PageGeometry::FALLBACK`].
pub fn resolve(width_px: Option<f64>, height_px: Option<f64>) -> PageGeometry {
    let (Some(width), Some(height)) = (usable(width_px), usable(height_px)) else {
        return PageGeometry::FALLBACK;
    };
    let ratio = width / height;
    if width >= height {
        PageGeometry {
            width_pt: LONG_EDGE_PT,
            height_pt: LONG_EDGE_PT / ratio,
        }
    } else {
        PageGeometry {
            width_pt: LONG_EDGE_PT * ratio,
            height_pt: LONG_EDGE_PT,
        }
    }
}

/// `width_px / height_px`, with the fallback page's ratio for unusable input.
pub fn aspect_ratio(width_px: Option<f64>, height_px: Option<f64>) -> f64 {
    match (usable(width_px), usable(height_px)) {
        (Some(width), Some(height)) => width / height,
        _ => FALLBACK_SHORT_EDGE_PT / LONG_EDGE_PT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZES: [(f64, f64); 8] = [
        (1.0, 1.0),
        (3508.0, 2480.0),
        (2480.0, 3508.0),
        (1920.0, 1080.0),
        (1080.0, 1920.0),
        (7.0, 3.0),
        (1.0, 10_000.0),
        (12_345.6, 789.1),
    ];

    #[test]
    fn long_edge_is_exact_and_ratio_preserved() {
        for (w, h) in SIZES {
            let geometry = resolve(Some(w), Some(h));
            let long = geometry.width_pt.max(geometry.height_pt);
            assert_eq!(long, LONG_EDGE_PT, "long edge for {w}x{h}");
            let ratio = geometry.width_pt / geometry.height_pt;
            assert!(
                ((ratio - w / h) / (w / h)).abs() < 1e-12,
                "ratio for {w}x{h}: {ratio}"
            );
            assert!((aspect_ratio(Some(w), Some(h)) - w / h).abs() < 1e-15);
        }
    }

    #[test]
    fn orientation_follows_pixels() {
        assert!(resolve(Some(2000.0), Some(1000.0)).is_landscape());
        assert!(!resolve(Some(1000.0), Some(2000.0)).is_landscape());
        let square = resolve(Some(500.0), Some(500.0));
        assert_eq!(square.width_pt, LONG_EDGE_PT);
        assert_eq!(square.height_pt, LONG_EDGE_PT);
    }

    #[test]
    fn unusable_dimensions_fall_back_to_portrait() {
        let expected = PageGeometry {
            width_pt: 595.28,
            height_pt: 841.89,
        };
        assert_eq!(resolve(Some(0.0), Some(100.0)), expected);
        assert_eq!(resolve(None, None), expected);
        assert_eq!(resolve(Some(-5.0), Some(10.0)), expected);
        assert_eq!(resolve(Some(100.0), None), expected);
        assert_eq!(resolve(Some(f64::NAN), Some(10.0)), expected);
        assert_eq!(resolve(Some(f64::INFINITY), Some(10.0)), expected);
        assert_eq!(aspect_ratio(None, Some(3.0)), 595.28 / 841.89);
    }

    #[test]
    fn normalized_positions_scale_by_page_edges() {
        let geometry = resolve(Some(2000.0), Some(1000.0));
        let (x, y) = geometry.to_points(0.5, 0.3);
        assert_eq!(x, 0.5 * 841.89);
        assert_eq!(y, 0.3 * (841.89 / 2.0));
    }
}
