//! Panoptic quality (PQ) evaluation.
//!
//! Segment ids are stored in RGB PNG files as `R + 256 * G + 256 * 256 * B`.
//! Id 0 marks void pixels.

use crate::{common::*, dataset::Category};
use image::{DynamicImage, ImageFormat, RgbImage};
use prettytable::{cell, row, Table};
use std::{ops::AddAssign, time::Instant};

const VOID: u32 = 0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub id: u32,
    pub category_id: i64,
    #[serde(default)]
    pub area: u64,
    #[serde(default)]
    pub iscrowd: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isthing: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[f64; 4]>,
}

/// Segments of one image together with the PNG file holding its id map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanopticAnnotation {
    pub image_id: i64,
    pub file_name: String,
    pub segments_info: Vec<SegmentInfo>,
}

/// Output of a panoptic post-processor for one image.
#[derive(Debug, Clone, PartialEq)]
pub struct PanopticPrediction {
    pub image_id: i64,
    pub file_name: String,
    /// PNG encoded id map.
    pub png_string: Vec<u8>,
    pub segments_info: Vec<SegmentInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PanopticJson {
    annotations: Vec<PanopticAnnotation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    categories: Vec<Category>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PqStatCat {
    pub iou: f64,
    pub tp: u64,
    pub fp: u64,
    pub fn_: u64,
}

impl AddAssign<&PqStatCat> for PqStatCat {
    fn add_assign(&mut self, rhs: &PqStatCat) {
        self.iou += rhs.iou;
        self.tp += rhs.tp;
        self.fp += rhs.fp;
        self.fn_ += rhs.fn_;
    }
}

#[derive(Debug, Clone, Default)]
pub struct PqStat {
    per_cat: HashMap<i64, PqStatCat>,
}

impl PqStat {
    pub fn get(&self, category_id: i64) -> PqStatCat {
        self.per_cat.get(&category_id).copied().unwrap_or_default()
    }

    fn entry(&mut self, category_id: i64) -> &mut PqStatCat {
        self.per_cat.entry(category_id).or_default()
    }

    /// Averages over categories, restricted to things or stuff when `isthing`
    /// is given. Categories without any segment do not count.
    pub fn pq_average(
        &self,
        categories: &IndexMap<i64, Category>,
        isthing: Option<bool>,
    ) -> (PqScore, IndexMap<i64, PqClassScore>) {
        let mut sum = PqScore::default();
        let mut per_class = IndexMap::new();

        for (&category_id, category) in categories {
            if let Some(isthing) = isthing {
                if isthing != category.is_thing() {
                    continue;
                }
            }

            let PqStatCat { iou, tp, fp, fn_ } = self.get(category_id);
            let (tp, fp, fn_) = (tp as f64, fp as f64, fn_ as f64);

            if tp + fp + fn_ == 0.0 {
                per_class.insert(category_id, PqClassScore::default());
                continue;
            }

            let denom = tp + 0.5 * fp + 0.5 * fn_;
            let score = PqClassScore {
                pq: iou / denom,
                sq: if tp != 0.0 { iou / tp } else { 0.0 },
                rq: tp / denom,
            };

            sum.n += 1;
            sum.pq += score.pq;
            sum.sq += score.sq;
            sum.rq += score.rq;
            per_class.insert(category_id, score);
        }

        let average = if sum.n == 0 {
            sum
        } else {
            let n = sum.n as f64;
            PqScore {
                pq: sum.pq / n,
                sq: sum.sq / n,
                rq: sum.rq / n,
                n: sum.n,
            }
        };

        (average, per_class)
    }
}

impl AddAssign<&PqStat> for PqStat {
    fn add_assign(&mut self, rhs: &PqStat) {
        for (&category_id, stat) in &rhs.per_cat {
            *self.entry(category_id) += stat;
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PqScore {
    pub pq: f64,
    pub sq: f64,
    pub rq: f64,
    pub n: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PqClassScore {
    pub pq: f64,
    pub sq: f64,
    pub rq: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PqResults {
    #[serde(rename = "All")]
    pub all: PqScore,
    #[serde(rename = "Things")]
    pub things: PqScore,
    #[serde(rename = "Stuff")]
    pub stuff: PqScore,
    pub per_class: IndexMap<i64, PqClassScore>,
}

impl PqResults {
    pub fn to_table(&self) -> Table {
        let mut table = Table::new();
        table.add_row(row!["", "PQ", "SQ", "RQ", "N"]);

        for (name, score) in [
            ("All", &self.all),
            ("Things", &self.things),
            ("Stuff", &self.stuff),
        ] {
            table.add_row(row![
                name,
                format!("{:5.1}", 100.0 * score.pq),
                format!("{:5.1}", 100.0 * score.sq),
                format!("{:5.1}", 100.0 * score.rq),
                score.n
            ]);
        }

        table
    }
}

/// Writes per-image PNGs as they arrive and computes PQ over all of them
/// at the end of an evaluation pass.
#[derive(Debug, Clone)]
pub struct PanopticEvaluator {
    gt_json: PathBuf,
    gt_folder: PathBuf,
    output_dir: PathBuf,
    predictions: Vec<PanopticAnnotation>,
}

impl PanopticEvaluator {
    pub fn new(
        gt_json: impl AsRef<Path>,
        gt_folder: impl AsRef<Path>,
        output_dir: impl AsRef<Path>,
        group: &dyn ProcessGroup,
    ) -> Result<Self> {
        let output_dir = output_dir.as_ref();

        if group.is_main_process() {
            fs::create_dir_all(output_dir).with_context(|| {
                format!("failed to create directory '{}'", output_dir.display())
            })?;
        }

        Ok(Self {
            gt_json: gt_json.as_ref().to_owned(),
            gt_folder: gt_folder.as_ref().to_owned(),
            output_dir: output_dir.to_owned(),
            predictions: vec![],
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn predictions(&self) -> &[PanopticAnnotation] {
        &self.predictions
    }

    /// Stores the PNGs of a batch under the output directory.
    pub fn update(&mut self, predictions: Vec<PanopticPrediction>) -> Result<()> {
        for prediction in predictions {
            let PanopticPrediction {
                image_id,
                file_name,
                png_string,
                segments_info,
            } = prediction;

            let path = self.output_dir.join(&file_name);
            fs::write(&path, &png_string)
                .with_context(|| format!("failed to write '{}'", path.display()))?;

            self.predictions.push(PanopticAnnotation {
                image_id,
                file_name,
                segments_info,
            });
        }
        Ok(())
    }

    pub fn synchronize_between_processes(&mut self, group: &dyn ProcessGroup) -> Result<()> {
        let gathered = process_group::all_gather(group, &self.predictions)?;
        self.predictions = gathered.into_iter().flatten().collect();
        Ok(())
    }

    /// Computes PQ on the main process. Other workers get `None`.
    pub fn summarize(&self, group: &dyn ProcessGroup) -> Result<Option<PqResults>> {
        if !group.is_main_process() {
            return Ok(None);
        }

        let predictions_json = self.output_dir.join("predictions.json");
        let json = PanopticJson {
            annotations: self.predictions.clone(),
            categories: vec![],
        };
        let text = serde_json::to_string(&json)?;
        fs::write(&predictions_json, text)
            .with_context(|| format!("failed to write '{}'", predictions_json.display()))?;

        let results = pq_compute(
            &self.gt_json,
            &predictions_json,
            Some(&self.gt_folder),
            Some(&self.output_dir),
        )?;
        Ok(Some(results))
    }
}

/// Computes panoptic quality of predictions against the ground truth.
///
/// The PNG folders default to the JSON paths without the `.json` suffix.
pub fn pq_compute(
    gt_json_file: &Path,
    pred_json_file: &Path,
    gt_folder: Option<&Path>,
    pred_folder: Option<&Path>,
) -> Result<PqResults> {
    let since = Instant::now();

    let gt_json = load_panoptic_json(gt_json_file)?;
    let pred_json = load_panoptic_json(pred_json_file)?;
    let gt_folder = gt_folder
        .map(Path::to_owned)
        .unwrap_or_else(|| gt_json_file.with_extension(""));
    let pred_folder = pred_folder
        .map(Path::to_owned)
        .unwrap_or_else(|| pred_json_file.with_extension(""));

    let categories: IndexMap<i64, Category> = gt_json
        .categories
        .iter()
        .map(|category| (category.id, category.clone()))
        .collect();

    info!("Evaluation panoptic segmentation metrics:");
    info!("Ground truth:");
    info!("\tSegmentation folder: {}", gt_folder.display());
    info!("\tJSON file: {}", gt_json_file.display());
    info!("Prediction:");
    info!("\tSegmentation folder: {}", pred_folder.display());
    info!("\tJSON file: {}", pred_json_file.display());

    ensure!(
        gt_folder.is_dir(),
        "folder '{}' with ground truth segmentations doesn't exist",
        gt_folder.display()
    );
    ensure!(
        pred_folder.is_dir(),
        "folder '{}' with predicted segmentations doesn't exist",
        pred_folder.display()
    );

    let pred_annotations: HashMap<i64, &PanopticAnnotation> = pred_json
        .annotations
        .iter()
        .map(|ann| (ann.image_id, ann))
        .collect();

    let mut pq_stat = PqStat::default();

    for gt_ann in &gt_json.annotations {
        let pred_ann = pred_annotations
            .get(&gt_ann.image_id)
            .ok_or_else(|| format_err!("no prediction for the image with id: {}", gt_ann.image_id))?;
        let stat = pq_compute_single(gt_ann, pred_ann, &gt_folder, &pred_folder, &categories)?;
        pq_stat += &stat;
    }

    let (all, per_class) = pq_stat.pq_average(&categories, None);
    let (things, _) = pq_stat.pq_average(&categories, Some(true));
    let (stuff, _) = pq_stat.pq_average(&categories, Some(false));

    let results = PqResults {
        all,
        things,
        stuff,
        per_class,
    };

    info!("\n{}", results.to_table());
    info!("Time elapsed: {:0.2} seconds", since.elapsed().as_secs_f64());

    Ok(results)
}

fn pq_compute_single(
    gt_ann: &PanopticAnnotation,
    pred_ann: &PanopticAnnotation,
    gt_folder: &Path,
    pred_folder: &Path,
    categories: &IndexMap<i64, Category>,
) -> Result<PqStat> {
    let image_id = gt_ann.image_id;
    let (pan_gt, gt_size) = load_id_map(&gt_folder.join(&gt_ann.file_name))?;
    let (pan_pred, pred_size) = load_id_map(&pred_folder.join(&pred_ann.file_name))?;
    ensure!(
        gt_size == pred_size,
        "image {} has ground truth size {:?} but prediction size {:?}",
        image_id,
        gt_size,
        pred_size
    );

    let gt_segms: HashMap<u32, &SegmentInfo> =
        gt_ann.segments_info.iter().map(|seg| (seg.id, seg)).collect();
    let mut pred_segms: IndexMap<u32, SegmentInfo> = pred_ann
        .segments_info
        .iter()
        .map(|seg| (seg.id, seg.clone()))
        .collect();

    // predicted areas come from the PNG
    let mut pred_counts: HashMap<u32, u64> = HashMap::new();
    for &id in &pan_pred {
        *pred_counts.entry(id).or_default() += 1;
    }

    let mut unseen: HashSet<u32> = pred_segms.keys().copied().collect();
    for (&label, &count) in &pred_counts {
        let segm = match pred_segms.get_mut(&label) {
            Some(segm) => segm,
            None if label == VOID => continue,
            None => bail!(
                "in the image with id {} segment with id {} is presented in PNG and not presented in JSON",
                image_id,
                label
            ),
        };
        segm.area = count;
        unseen.remove(&label);
        ensure!(
            categories.contains_key(&segm.category_id),
            "in the image with id {} segment with id {} has unknown category_id {}",
            image_id,
            label,
            segm.category_id
        );
    }
    ensure!(
        unseen.is_empty(),
        "in the image with id {} the following segment ids {:?} are presented in JSON and not presented in PNG",
        image_id,
        unseen.iter().sorted().collect::<Vec<_>>()
    );

    // intersection of every (gt, pred) pair
    let mut gt_pred_map: HashMap<(u32, u32), u64> = HashMap::new();
    for (&gt_id, &pred_id) in pan_gt.iter().zip(&pan_pred) {
        *gt_pred_map.entry((gt_id, pred_id)).or_default() += 1;
    }

    let mut pq_stat = PqStat::default();
    let mut gt_matched = HashSet::new();
    let mut pred_matched = HashSet::new();

    for (&(gt_label, pred_label), &intersection) in &gt_pred_map {
        let (gt_segm, pred_segm) = match (gt_segms.get(&gt_label), pred_segms.get(&pred_label)) {
            (Some(gt_segm), Some(pred_segm)) => (gt_segm, pred_segm),
            _ => continue,
        };
        if gt_segm.iscrowd == 1 || gt_segm.category_id != pred_segm.category_id {
            continue;
        }

        let void_overlap = gt_pred_map.get(&(VOID, pred_label)).copied().unwrap_or(0);
        let union = pred_segm.area as f64 + gt_segm.area as f64
            - intersection as f64
            - void_overlap as f64;
        let iou = intersection as f64 / union;

        if iou > 0.5 {
            let stat = pq_stat.entry(gt_segm.category_id);
            stat.tp += 1;
            stat.iou += iou;
            gt_matched.insert(gt_label);
            pred_matched.insert(pred_label);
        }
    }

    // unmatched ground truth, crowd regions excluded
    let mut crowd_labels: HashMap<i64, u32> = HashMap::new();
    for (&gt_label, gt_info) in &gt_segms {
        if gt_matched.contains(&gt_label) {
            continue;
        }
        if gt_info.iscrowd == 1 {
            crowd_labels.insert(gt_info.category_id, gt_label);
            continue;
        }
        pq_stat.entry(gt_info.category_id).fn_ += 1;
    }

    // unmatched predictions, unless mostly on void or crowd pixels
    for (&pred_label, pred_info) in &pred_segms {
        if pred_matched.contains(&pred_label) {
            continue;
        }

        let mut intersection = gt_pred_map.get(&(VOID, pred_label)).copied().unwrap_or(0);
        if let Some(&crowd_label) = crowd_labels.get(&pred_info.category_id) {
            intersection += gt_pred_map
                .get(&(crowd_label, pred_label))
                .copied()
                .unwrap_or(0);
        }

        if intersection as f64 / pred_info.area as f64 > 0.5 {
            continue;
        }
        pq_stat.entry(pred_info.category_id).fp += 1;
    }

    Ok(pq_stat)
}

fn load_panoptic_json(path: &Path) -> Result<PanopticJson> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read '{}'", path.display()))?;
    let json = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse '{}'", path.display()))?;
    Ok(json)
}

/// Loads a PNG id map, returning ids in row-major order and `(width, height)`.
pub fn load_id_map(path: &Path) -> Result<(Vec<u32>, (u32, u32))> {
    let image = image::io::Reader::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?
        .with_guessed_format()
        .with_context(|| format!("failed to determine the image file format: {}", path.display()))?
        .decode()
        .with_context(|| format!("failed to decode image file: {}", path.display()))?
        .to_rgb8();

    let size = image.dimensions();
    let ids = image.pixels().map(|pixel| rgb2id(pixel.0)).collect();
    Ok((ids, size))
}

/// Encodes a row-major id map into PNG bytes.
pub fn encode_id_map(ids: &[u32], width: u32, height: u32) -> Result<Vec<u8>> {
    ensure!(
        ids.len() == width as usize * height as usize,
        "expect {} ids for a {}x{} image, but get {}",
        width as usize * height as usize,
        width,
        height,
        ids.len()
    );

    let raw: Vec<u8> = ids.iter().flat_map(|&id| id2rgb(id)).collect();
    let image = RgbImage::from_raw(width, height, raw)
        .ok_or_else(|| format_err!("invalid id map buffer"))?;

    let mut bytes = vec![];
    DynamicImage::ImageRgb8(image).write_to(&mut bytes, ImageFormat::Png)?;
    Ok(bytes)
}

pub fn rgb2id([r, g, b]: [u8; 3]) -> u32 {
    r as u32 + 256 * g as u32 + 256 * 256 * b as u32
}

pub fn id2rgb(id: u32) -> [u8; 3] {
    [(id % 256) as u8, (id / 256 % 256) as u8, (id / 256 / 256 % 256) as u8]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn categories() -> IndexMap<i64, Category> {
        [(1, Some(1)), (2, Some(0))]
            .into_iter()
            .map(|(id, isthing)| {
                let category = Category {
                    id,
                    name: format!("c{}", id),
                    supercategory: None,
                    isthing,
                };
                (id, category)
            })
            .collect()
    }

    #[test]
    fn rgb_id_conversion() {
        assert_eq!(rgb2id([1, 2, 3]), 1 + 2 * 256 + 3 * 65536);
        assert_eq!(id2rgb(rgb2id([7, 0, 200])), [7, 0, 200]);
    }

    #[test]
    fn average_over_things_and_stuff() {
        let mut stat = PqStat::default();
        *stat.entry(1) = PqStatCat {
            iou: 1.8,
            tp: 2,
            fp: 0,
            fn_: 0,
        };
        *stat.entry(2) = PqStatCat {
            iou: 0.0,
            tp: 0,
            fp: 1,
            fn_: 1,
        };

        let categories = categories();
        let (things, per_class) = stat.pq_average(&categories, Some(true));
        assert_eq!(things.n, 1);
        assert_abs_diff_eq!(things.pq, 0.9, epsilon = 1e-12);
        assert_abs_diff_eq!(things.sq, 0.9, epsilon = 1e-12);
        assert_abs_diff_eq!(things.rq, 1.0, epsilon = 1e-12);
        assert_eq!(per_class.len(), 1);

        let (all, per_class) = stat.pq_average(&categories, None);
        assert_eq!(all.n, 2);
        assert_abs_diff_eq!(all.pq, 0.45, epsilon = 1e-12);
        assert_eq!(per_class[&2], PqClassScore::default());

        let empty = PqStat::default();
        let (stuff, _) = empty.pq_average(&categories, Some(false));
        assert_eq!(stuff, PqScore::default());
    }
}
