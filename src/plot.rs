use std::path::Path;

use image::RgbImage;
use plotters::prelude::*;

use crate::calibrate::CalibratedTemplate;
use crate::layout::SheetLayout;
use crate::omr::MarkPoint;

pub const PLOT_WIDTH: u32 = 900;
const MARGIN: i32 = 120;

const NOMINAL_COLOR: RGBColor = RGBColor(160, 160, 160);
const CALIBRATED_COLOR: RGBColor = RGBColor(30, 80, 220);
const DRIFT_COLOR: RGBColor = RGBColor(220, 40, 40);
const COLUMN_COLOR: RGBColor = RGBColor(215, 225, 245);

/// Renders nominal (grey rings) vs calibrated (blue dots) slot positions, each
/// pair joined by a red drift segment, over one guide line per layout column.
///
/// Sheet coordinates are scaled so the page fits `width` pixels.
pub fn render_calibration_plot(
    nominal: &SheetLayout,
    calibrated: &CalibratedTemplate,
    width: u32,
) -> Result<RgbImage, String> {
    let before = nominal.positions();
    let after = calibrated.layout().positions();
    if before.len() != after.len() {
        return Err(format!(
            "slot count mismatch: {} nominal vs {} calibrated",
            before.len(),
            after.len()
        ));
    }

    let max_x = before.iter().chain(&after).map(|p| p.x).max().unwrap_or(0).max(0) + MARGIN;
    let max_y = before.iter().chain(&after).map(|p| p.y).max().unwrap_or(0).max(0) + MARGIN;
    let width = width.max(1);
    let scale = width as f64 / max_x as f64;
    let height = ((max_y as f64 * scale).ceil() as u32).max(1);
    let to_px = |p: MarkPoint| ((p.x as f64 * scale) as i32, (p.y as f64 * scale) as i32);

    let pixel_count = (width as usize)
        .checked_mul(height as usize)
        .ok_or_else(|| "width*height overflow".to_string())?;
    let mut rgb = vec![255u8; pixel_count * 3];

    {
        let root = BitMapBackend::with_buffer(&mut rgb, (width, height)).into_drawing_area();
        root.fill(&WHITE).map_err(|e| e.to_string())?;

        for range in calibrated.layout().partition().ranges() {
            let column = &after[range];
            if column.is_empty() {
                continue;
            }
            let mean_x = column.iter().map(|p| p.x as i64).sum::<i64>() / column.len() as i64;
            let top = column.iter().map(|p| p.y).min().unwrap_or(0);
            let bottom = column.iter().map(|p| p.y).max().unwrap_or(0);
            let x = mean_x as i32;
            root.draw(&PathElement::new(
                [to_px(MarkPoint::new(x, top)), to_px(MarkPoint::new(x, bottom))],
                COLUMN_COLOR.stroke_width(3),
            ))
            .map_err(|e| e.to_string())?;
        }

        for (&from, &to) in before.iter().zip(&after) {
            if from != to {
                root.draw(&PathElement::new([to_px(from), to_px(to)], DRIFT_COLOR))
                    .map_err(|e| e.to_string())?;
            }
            root.draw(&Circle::new(to_px(from), 5, NOMINAL_COLOR.stroke_width(1)))
                .map_err(|e| e.to_string())?;
            root.draw(&Circle::new(to_px(to), 3, CALIBRATED_COLOR.filled()))
                .map_err(|e| e.to_string())?;
        }

        root.present().map_err(|e| e.to_string())?;
    }

    RgbImage::from_raw(width, height, rgb)
        .ok_or_else(|| format!("failed to build {width}x{height} plot image"))
}

pub fn write_calibration_plot(
    path: &Path,
    nominal: &SheetLayout,
    calibrated: &CalibratedTemplate,
) -> Result<(), String> {
    render_calibration_plot(nominal, calibrated, PLOT_WIDTH)?
        .save(path)
        .map_err(|e| format!("failed to save {}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn plot_fits_requested_width_and_keeps_page_aspect() {
        let layout = SheetLayout::builtin().unwrap();
        let template = CalibratedTemplate::from_nominal(&layout);
        let img = render_calibration_plot(&layout, &template, 300).unwrap();
        assert_eq!(img.width(), 300);
        assert!(img.height() > img.width());
    }

    #[test]
    fn calibrated_positions_are_drawn_in_blue() {
        let layout = SheetLayout::builtin().unwrap();
        let template = CalibratedTemplate::from_nominal(&layout);
        let img = render_calibration_plot(&layout, &template, PLOT_WIDTH).unwrap();

        let max_x = layout.positions().iter().map(|p| p.x).max().unwrap() + MARGIN;
        let scale = PLOT_WIDTH as f64 / max_x as f64;
        let p = layout.slots()[4].position;
        let px = (p.x as f64 * scale) as u32;
        let py = (p.y as f64 * scale) as u32;
        assert_eq!(*img.get_pixel(px, py), Rgb([30, 80, 220]));
        assert_eq!(*img.get_pixel(1, 1), Rgb([255, 255, 255]));
    }
}
