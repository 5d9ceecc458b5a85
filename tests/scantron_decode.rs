use scantron_reader::calibrate::{CalibratedTemplate, calibrate};
use scantron_reader::layout::SheetLayout;
use scantron_reader::omr::MarkPoint;
use scantron_reader::resolve::{FieldValue, HitPolicy, ResolverConfig, resolve};

fn detector_order(points: &[MarkPoint]) -> Vec<MarkPoint> {
    let mut sorted = points.to_vec();
    sorted.sort_unstable();
    sorted
}

fn config(d: i32) -> ResolverConfig {
    ResolverConfig {
        pixel_differential: d,
        hit_policy: HitPolicy::Nearest,
    }
}

#[test]
fn nominal_key_and_two_marks_decode_end_to_end() {
    let layout = SheetLayout::builtin().expect("builtin layout");
    let key = detector_order(&layout.positions());
    let calibration = calibrate(&[key], &layout).expect("calibration");
    assert_eq!(calibration.keys_used(), 1);
    assert_eq!(calibration.template.layout().positions(), layout.positions());

    let template = &calibration.template;
    let sheet = vec![
        template.layout().slot_by_label("Tele HP TL").unwrap().position,
        template.layout().slot_by_label("Blue Alliance").unwrap().position,
    ];
    let record = resolve(template, &detector_order(&sheet), &config(40));

    assert_eq!(record.len(), layout.fields().len());
    for (name, value) in record.iter() {
        let expected = match name {
            "Team" => FieldValue::Digits("0000".into()),
            "Match" => FieldValue::Digits("00".into()),
            "Alliance" => FieldValue::Text("blue".into()),
            "Tele HP TL" => FieldValue::Code(1),
            _ => FieldValue::Code(0),
        };
        assert_eq!(*value, expected, "field {name}");
    }
}

#[test]
fn calibration_absorbs_scan_drift_that_nominal_positions_miss() {
    let layout = SheetLayout::builtin().unwrap();
    let drift = |p: &MarkPoint| MarkPoint::new(p.x + 45, p.y - 38);
    let key_a: Vec<MarkPoint> = layout.positions().iter().map(drift).collect();
    let key_b: Vec<MarkPoint> = layout
        .positions()
        .iter()
        .map(|p| MarkPoint::new(p.x + 47, p.y - 36))
        .collect();
    let calibration =
        calibrate(&[detector_order(&key_a), detector_order(&key_b)], &layout).unwrap();

    let labels = [
        "Team Kilo Two",
        "Team Hecto Four",
        "Team Deca Eight",
        "Team Five",
        "Match Deca One",
        "Match Three",
        "Red Alliance",
    ];
    let sheet: Vec<MarkPoint> = labels
        .iter()
        .map(|label| drift(&layout.slot_by_label(label).unwrap().position))
        .collect();

    let nominal = CalibratedTemplate::from_nominal(&layout);
    let missed = resolve(&nominal, &sheet, &config(30));
    assert_eq!(missed.get("Team"), Some(&FieldValue::Digits("0000".into())));
    assert_eq!(missed.get("Alliance"), Some(&FieldValue::Text(String::new())));

    let record = resolve(&calibration.template, &sheet, &config(30));
    assert_eq!(record.get("Team"), Some(&FieldValue::Digits("2485".into())));
    assert_eq!(record.get("Match"), Some(&FieldValue::Digits("13".into())));
    assert_eq!(record.get("Alliance"), Some(&FieldValue::Text("red".into())));
}

#[test]
fn stray_marks_do_not_override_the_first_digit() {
    let layout = SheetLayout::builtin().unwrap();
    let template = CalibratedTemplate::from_nominal(&layout);
    let at = |label: &str| layout.slot_by_label(label).unwrap().position;
    let sheet = [
        at("Team Kilo Nine"),
        at("Team Kilo Three"),
        at("Team Hecto Zero"),
        at("Team Deca Zero"),
        at("Team Six"),
    ];
    let record = resolve(&template, &sheet, &config(30));
    // Kilo Three has the lower ordinal, so it wins over Kilo Nine.
    assert_eq!(record.get("Team"), Some(&FieldValue::Digits("3006".into())));
}
