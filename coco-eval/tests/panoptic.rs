use anyhow::Result;
use approx::assert_abs_diff_eq;
use coco_eval::{
    panoptic::{encode_id_map, load_id_map},
    PanopticEvaluator, PanopticPrediction, SegmentInfo,
};
use process_group::SingleProcess;
use serde_json::json;
use std::fs;

const WIDTH: u32 = 4;
const HEIGHT: u32 = 4;

/// Left half is `left`, right half is `right`, row-major.
fn halves(left: u32, right: u32) -> Vec<u32> {
    (0..HEIGHT)
        .flat_map(|_| (0..WIDTH).map(move |x| if x < WIDTH / 2 { left } else { right }))
        .collect()
}

fn segment(id: u32, category_id: i64) -> SegmentInfo {
    SegmentInfo {
        id,
        category_id,
        area: 0,
        iscrowd: 0,
        isthing: None,
        bbox: None,
    }
}

#[test]
fn pq_of_written_predictions() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let gt_folder = dir.path().join("panoptic_val");
    let gt_json = dir.path().join("panoptic_val.json");
    let output_dir = dir.path().join("panoptic_eval");
    fs::create_dir_all(&gt_folder)?;

    // thing on the left, stuff on the right
    fs::write(
        gt_folder.join("000000000001.png"),
        encode_id_map(&halves(1, 2), WIDTH, HEIGHT)?,
    )?;
    let gt = json!({
        "annotations": [{
            "image_id": 1,
            "file_name": "000000000001.png",
            "segments_info": [
                {"id": 1, "category_id": 1, "area": 8, "iscrowd": 0},
                {"id": 2, "category_id": 2, "area": 8, "iscrowd": 0}
            ]
        }],
        "categories": [
            {"id": 1, "name": "person", "isthing": 1},
            {"id": 2, "name": "grass", "isthing": 0}
        ]
    });
    fs::write(&gt_json, serde_json::to_string(&gt)?)?;

    // the predicted thing misses its top-left pixel
    let mut ids = halves(5, 6);
    ids[0] = 0;
    let prediction = PanopticPrediction {
        image_id: 1,
        file_name: format!("{:012}.png", 1),
        png_string: encode_id_map(&ids, WIDTH, HEIGHT)?,
        segments_info: vec![segment(5, 1), segment(6, 2)],
    };

    let group = SingleProcess;
    let mut evaluator = PanopticEvaluator::new(&gt_json, &gt_folder, &output_dir, &group)?;
    evaluator.update(vec![prediction])?;
    evaluator.synchronize_between_processes(&group)?;

    let (written, size) = load_id_map(&output_dir.join("000000000001.png"))?;
    assert_eq!(size, (WIDTH, HEIGHT));
    assert_eq!(written, ids);

    let results = evaluator.summarize(&group)?.unwrap();
    assert!(output_dir.join("predictions.json").is_file());

    assert_eq!(results.all.n, 2);
    assert_abs_diff_eq!(results.things.pq, 7.0 / 8.0, epsilon = 1e-9);
    assert_abs_diff_eq!(results.things.rq, 1.0, epsilon = 1e-9);
    assert_abs_diff_eq!(results.stuff.pq, 1.0, epsilon = 1e-9);
    assert_abs_diff_eq!(results.all.pq, (7.0 / 8.0 + 1.0) / 2.0, epsilon = 1e-9);
    assert_eq!(results.per_class.len(), 2);

    Ok(())
}

#[test]
fn missing_prediction_is_an_error() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let gt_folder = dir.path().join("gt");
    let gt_json = dir.path().join("gt.json");
    fs::create_dir_all(&gt_folder)?;

    let gt = json!({
        "annotations": [{"image_id": 9, "file_name": "000000000009.png", "segments_info": []}],
        "categories": [{"id": 1, "name": "person", "isthing": 1}]
    });
    fs::write(&gt_json, serde_json::to_string(&gt)?)?;

    let group = SingleProcess;
    let evaluator = PanopticEvaluator::new(&gt_json, &gt_folder, dir.path().join("out"), &group)?;
    assert!(evaluator.summarize(&group).is_err());

    Ok(())
}
