//! Per-image matching, accumulation and summary of COCO detection metrics.

use crate::{
    common::*,
    dataset::{CocoDataset, ResultAnnotation},
    mask::{self, Rle},
    params::{IouType, Params},
};
use std::time::Instant;

const EPS: f64 = 2.220446049250313e-16;

/// Number of summary statistics produced by [CocoEval::summarize].
pub const NUM_STATS: usize = 12;

/// Matching outcome of one image, one category and one area range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalImg {
    pub image_id: i64,
    pub category_id: i64,
    pub area_range: usize,
    pub max_det: usize,
    pub dt_ids: Vec<i64>,
    pub gt_ids: Vec<i64>,
    /// Matched ground truth id per IoU threshold and detection.
    pub dt_matches: Vec<Vec<Option<i64>>>,
    /// Matched detection id per IoU threshold and ground truth.
    pub gt_matches: Vec<Vec<Option<i64>>>,
    #[serde(with = "score_bits")]
    pub dt_scores: Vec<f64>,
    pub gt_ignore: Vec<bool>,
    pub dt_ignore: Vec<Vec<bool>>,
}

/// Scores are exchanged as bit patterns, since JSON has no NaN.
mod score_bits {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(scores: &[f64], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let bits: Vec<u64> = scores.iter().map(|score| score.to_bits()).collect();
        bits.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<f64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bits = Vec::<u64>::deserialize(deserializer)?;
        Ok(bits.into_iter().map(f64::from_bits).collect())
    }
}

/// Precision and recall tables.
///
/// `precision` and `scores` are indexed by `[iou, recall, category, area, max_det]`
/// and `recall` by `[iou, category, area, max_det]`. Missing entries hold `-1`.
#[derive(Debug, Clone)]
pub struct Accumulation {
    pub num_iou: usize,
    pub num_rec: usize,
    pub num_cat: usize,
    pub num_area: usize,
    pub num_max_det: usize,
    pub precision: Vec<f64>,
    pub recall: Vec<f64>,
    pub scores: Vec<f64>,
}

impl Accumulation {
    fn new(num_iou: usize, num_rec: usize, num_cat: usize, num_area: usize, num_max_det: usize) -> Self {
        let size = num_iou * num_rec * num_cat * num_area * num_max_det;
        Self {
            num_iou,
            num_rec,
            num_cat,
            num_area,
            num_max_det,
            precision: vec![-1.0; size],
            recall: vec![-1.0; num_iou * num_cat * num_area * num_max_det],
            scores: vec![-1.0; size],
        }
    }

    pub fn precision_index(&self, t: usize, r: usize, k: usize, a: usize, m: usize) -> usize {
        (((t * self.num_rec + r) * self.num_cat + k) * self.num_area + a) * self.num_max_det + m
    }

    pub fn recall_index(&self, t: usize, k: usize, a: usize, m: usize) -> usize {
        ((t * self.num_cat + k) * self.num_area + a) * self.num_max_det + m
    }
}

#[derive(Debug, Clone)]
struct GtInstance {
    id: i64,
    area: f64,
    iscrowd: bool,
    ignore: bool,
}

#[derive(Debug, Clone)]
struct DtInstance {
    id: i64,
    score: f64,
    area: f64,
}

/// COCO evaluation of one IoU type against a ground truth dataset.
#[derive(Debug, Clone)]
pub struct CocoEval {
    gt: Arc<CocoDataset>,
    iou_type: IouType,
    params: Params,
    eval_imgs: BTreeMap<i64, Vec<Option<EvalImg>>>,
    accumulation: Option<Accumulation>,
    stats: Option<[f64; NUM_STATS]>,
}

impl CocoEval {
    pub fn new(gt: Arc<CocoDataset>, iou_type: IouType) -> Self {
        let params = Params::new(gt.category_ids());
        Self {
            gt,
            iou_type,
            params,
            eval_imgs: BTreeMap::new(),
            accumulation: None,
            stats: None,
        }
    }

    pub fn iou_type(&self) -> IouType {
        self.iou_type
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Ids of the images evaluated so far, sorted.
    pub fn image_ids(&self) -> Vec<i64> {
        self.eval_imgs.keys().copied().collect()
    }

    pub fn eval_imgs(&self) -> &BTreeMap<i64, Vec<Option<EvalImg>>> {
        &self.eval_imgs
    }

    pub fn accumulation(&self) -> Option<&Accumulation> {
        self.accumulation.as_ref()
    }

    pub fn stats(&self) -> Option<&[f64; NUM_STATS]> {
        self.stats.as_ref()
    }

    /// Matches the detections of the given images against the ground truth.
    ///
    /// Results on images outside of `image_ids` are ignored. Images that were
    /// already evaluated keep their first outcome.
    pub fn evaluate_images(&mut self, image_ids: &[i64], results: &[ResultAnnotation]) -> Result<()> {
        let image_ids: Vec<_> = image_ids.iter().copied().sorted().dedup().collect();
        let image_set: HashSet<_> = image_ids.iter().copied().collect();

        for result in results {
            ensure!(
                self.gt.image(result.image_id).is_some(),
                "result refers to image {} which is not in the ground truth",
                result.image_id
            );
        }

        // group results by image and category, ids start from 1
        let mut grouped: HashMap<(i64, i64), Vec<(i64, &ResultAnnotation)>> = HashMap::new();
        results
            .iter()
            .enumerate()
            .filter(|(_, result)| image_set.contains(&result.image_id))
            .for_each(|(index, result)| {
                grouped
                    .entry((result.image_id, result.category_id))
                    .or_default()
                    .push((index as i64 + 1, result));
            });

        let num_area = self.params.area_rngs.len();

        for &image_id in &image_ids {
            let mut per_image = Vec::with_capacity(self.params.cat_ids.len() * num_area);

            for &category_id in &self.params.cat_ids {
                let dts = grouped
                    .get(&(image_id, category_id))
                    .map(|dts| dts.as_slice())
                    .unwrap_or(&[]);
                let evals = self.evaluate_category(image_id, category_id, dts)?;
                per_image.extend(evals);
            }

            self.eval_imgs.entry(image_id).or_insert(per_image);
        }

        Ok(())
    }

    /// Adds outcomes computed elsewhere, e.g. on other workers.
    pub fn merge(&mut self, eval_imgs: impl IntoIterator<Item = (i64, Vec<Option<EvalImg>>)>) {
        for (image_id, evals) in eval_imgs {
            self.eval_imgs.entry(image_id).or_insert(evals);
        }
    }

    fn evaluate_category(
        &self,
        image_id: i64,
        category_id: i64,
        results: &[(i64, &ResultAnnotation)],
    ) -> Result<Vec<Option<EvalImg>>> {
        let num_area = self.params.area_rngs.len();
        let max_det = self.params.max_det();
        let anns: Vec<_> = self.gt.annotations(image_id, category_id).collect();

        if anns.is_empty() && results.is_empty() {
            return Ok(vec![None; num_area]);
        }

        let gts: Vec<_> = anns
            .iter()
            .map(|ann| GtInstance {
                id: ann.id,
                area: ann.area,
                iscrowd: ann.is_crowd(),
                ignore: ann.is_crowd(),
            })
            .collect();

        // sort detections by descending score, keeping the order of ties
        let results: Vec<_> = results
            .iter()
            .sorted_by(|(_, lhs), (_, rhs)| rhs.score.total_cmp(&lhs.score))
            .take(max_det)
            .collect();

        let iscrowd: Vec<_> = gts.iter().map(|gt| gt.iscrowd).collect();

        let (dts, ious) = match self.iou_type {
            IouType::Bbox => {
                let dt_boxes: Vec<_> = results
                    .iter()
                    .map(|(_, result)| result_bbox(result))
                    .collect::<Result<_>>()?;
                let gt_boxes: Vec<_> = anns.iter().map(|ann| ann.bbox).collect();
                let dts: Vec<_> = izip!(&results, &dt_boxes)
                    .map(|((id, result), bbox)| DtInstance {
                        id: *id,
                        score: result.score,
                        area: bbox[2] * bbox[3],
                    })
                    .collect();
                (dts, mask::bbox_iou(&dt_boxes, &gt_boxes, &iscrowd))
            }
            IouType::Segm => {
                let image = self
                    .gt
                    .image(image_id)
                    .ok_or_else(|| format_err!("unknown image {}", image_id))?;
                let dt_masks: Vec<_> = results
                    .iter()
                    .map(|(_, result)| result_mask(result, image.height, image.width))
                    .collect::<Result<_>>()?;
                let gt_masks: Vec<_> = anns
                    .iter()
                    .map(|ann| self.gt.annotation_rle(ann))
                    .collect::<Result<_>>()?;
                let dts: Vec<_> = izip!(&results, &dt_masks)
                    .map(|((id, result), rle)| DtInstance {
                        id: *id,
                        score: result.score,
                        area: match result.bbox {
                            Some(bbox) => bbox[2] * bbox[3],
                            None => rle.area() as f64,
                        },
                    })
                    .collect();
                (dts, mask::mask_iou(&dt_masks, &gt_masks, &iscrowd))
            }
        };

        let evals = (0..num_area)
            .map(|area_index| {
                Some(self.evaluate_image(
                    image_id,
                    category_id,
                    area_index,
                    max_det,
                    &gts,
                    &dts,
                    &ious,
                ))
            })
            .collect();

        Ok(evals)
    }

    #[allow(clippy::too_many_arguments)]
    fn evaluate_image(
        &self,
        image_id: i64,
        category_id: i64,
        area_index: usize,
        max_det: usize,
        gts: &[GtInstance],
        dts: &[DtInstance],
        ious: &[Vec<f64>],
    ) -> EvalImg {
        let area_range = &self.params.area_rngs[area_index];
        let iou_thrs = &self.params.iou_thrs;
        let num_iou = iou_thrs.len();

        // ignored ground truth goes last
        let gt_order: Vec<usize> = (0..gts.len())
            .sorted_by_key(|&index| {
                let gt = &gts[index];
                gt.ignore || !area_range.contains(gt.area)
            })
            .collect();
        let gts: Vec<_> = gt_order.iter().map(|&index| &gts[index]).collect();
        let gt_ignore: Vec<bool> = gts
            .iter()
            .map(|gt| gt.ignore || !area_range.contains(gt.area))
            .collect();

        let dts = &dts[..dts.len().min(max_det)];
        let num_gt = gts.len();
        let num_dt = dts.len();

        let mut gt_matches = vec![vec![None; num_gt]; num_iou];
        let mut dt_matches = vec![vec![None; num_dt]; num_iou];
        let mut dt_ignore = vec![vec![false; num_dt]; num_iou];

        if num_gt > 0 && num_dt > 0 {
            for (tind, &thr) in iou_thrs.iter().enumerate() {
                for (dind, dt) in dts.iter().enumerate() {
                    let mut best_iou = thr.min(1.0 - 1e-10);
                    let mut best: Option<usize> = None;

                    for (gind, gt) in gts.iter().enumerate() {
                        // a matched non-crowd ground truth is taken
                        if gt_matches[tind][gind].is_some() && !gt.iscrowd {
                            continue;
                        }
                        // stop at ignored ground truth once a regular one matched
                        if let Some(m) = best {
                            if !gt_ignore[m] && gt_ignore[gind] {
                                break;
                            }
                        }

                        let iou = ious[dind][gt_order[gind]];
                        if iou < best_iou {
                            continue;
                        }
                        best_iou = iou;
                        best = Some(gind);
                    }

                    if let Some(m) = best {
                        dt_ignore[tind][dind] = gt_ignore[m];
                        dt_matches[tind][dind] = Some(gts[m].id);
                        gt_matches[tind][m] = Some(dt.id);
                    }
                }
            }
        }

        // unmatched detections outside of the area range are ignored
        for (tind, dind) in iproduct!(0..num_iou, 0..num_dt) {
            if dt_matches[tind][dind].is_none() && !area_range.contains(dts[dind].area) {
                dt_ignore[tind][dind] = true;
            }
        }

        EvalImg {
            image_id,
            category_id,
            area_range: area_index,
            max_det,
            dt_ids: dts.iter().map(|dt| dt.id).collect(),
            gt_ids: gts.iter().map(|gt| gt.id).collect(),
            dt_matches,
            gt_matches,
            dt_scores: dts.iter().map(|dt| dt.score).collect(),
            gt_ignore,
            dt_ignore,
        }
    }

    /// Builds the precision and recall tables from the per-image outcomes.
    pub fn accumulate(&mut self) {
        info!("Accumulating evaluation results...");
        let since = Instant::now();

        let params = &self.params;
        let num_iou = params.iou_thrs.len();
        let num_rec = params.rec_thrs.len();
        let num_cat = params.cat_ids.len();
        let num_area = params.area_rngs.len();
        let num_max_det = params.max_dets.len();
        let mut acc = Accumulation::new(num_iou, num_rec, num_cat, num_area, num_max_det);

        for (k, a) in iproduct!(0..num_cat, 0..num_area) {
            let evals: Vec<&EvalImg> = self
                .eval_imgs
                .values()
                .filter_map(|evals| evals.get(k * num_area + a).and_then(|eval| eval.as_ref()))
                .collect();

            if evals.is_empty() {
                continue;
            }

            for (m, &max_det) in params.max_dets.iter().enumerate() {
                // (score, image index, detection index) of the kept detections
                let dets: Vec<(f64, usize, usize)> = evals
                    .iter()
                    .enumerate()
                    .flat_map(|(eindex, eval)| {
                        eval.dt_scores
                            .iter()
                            .take(max_det)
                            .enumerate()
                            .map(move |(dindex, &score)| (score, eindex, dindex))
                    })
                    .sorted_by(|lhs, rhs| rhs.0.total_cmp(&lhs.0))
                    .collect();

                let num_pos = evals
                    .iter()
                    .flat_map(|eval| &eval.gt_ignore)
                    .filter(|&&ignore| !ignore)
                    .count();
                if num_pos == 0 {
                    continue;
                }

                for t in 0..num_iou {
                    let mut tp = 0.0;
                    let mut fp = 0.0;
                    let mut rc = Vec::with_capacity(dets.len());
                    let mut pr = Vec::with_capacity(dets.len());

                    for &(_, eindex, dindex) in &dets {
                        let eval = evals[eindex];
                        let matched = eval.dt_matches[t][dindex].is_some();
                        let ignored = eval.dt_ignore[t][dindex];

                        if !ignored {
                            if matched {
                                tp += 1.0;
                            } else {
                                fp += 1.0;
                            }
                        }

                        rc.push(tp / num_pos as f64);
                        pr.push(tp / (fp + tp + EPS));
                    }

                    let recall_index = acc.recall_index(t, k, a, m);
                    acc.recall[recall_index] = rc.last().copied().unwrap_or(0.0);

                    // make precision monotonically decreasing
                    for i in (1..pr.len()).rev() {
                        if pr[i] > pr[i - 1] {
                            pr[i - 1] = pr[i];
                        }
                    }

                    let mut q = vec![0.0; num_rec];
                    let mut ss = vec![0.0; num_rec];

                    for (ri, &rec_thr) in params.rec_thrs.iter().enumerate() {
                        let pi = rc.partition_point(|&recall| recall < rec_thr);
                        if pi >= pr.len() {
                            break;
                        }
                        q[ri] = pr[pi];
                        ss[ri] = dets[pi].0;
                    }

                    for r in 0..num_rec {
                        let index = acc.precision_index(t, r, k, a, m);
                        acc.precision[index] = q[r];
                        acc.scores[index] = ss[r];
                    }
                }
            }
        }

        self.accumulation = Some(acc);
        info!("DONE (t={:.2}s).", since.elapsed().as_secs_f64());
    }

    /// Computes and logs the 12 standard COCO statistics.
    pub fn summarize(&mut self) -> Result<[f64; NUM_STATS]> {
        let acc = self
            .accumulation
            .as_ref()
            .ok_or_else(|| format_err!("accumulate() must be called before summarize()"))?;
        let max_dets = &self.params.max_dets;
        let last = max_dets.last().copied().unwrap_or(100);

        let summary = |ap: bool, iou_thr: Option<f64>, area: &str, max_det: usize| {
            summarize_one(&self.params, acc, ap, iou_thr, area, max_det)
        };

        let stats = [
            summary(true, None, "all", last),
            summary(true, Some(0.5), "all", last),
            summary(true, Some(0.75), "all", last),
            summary(true, None, "small", last),
            summary(true, None, "medium", last),
            summary(true, None, "large", last),
            summary(false, None, "all", max_dets[0]),
            summary(false, None, "all", max_dets[1]),
            summary(false, None, "all", last),
            summary(false, None, "small", last),
            summary(false, None, "medium", last),
            summary(false, None, "large", last),
        ];

        self.stats = Some(stats);
        Ok(stats)
    }
}

fn summarize_one(
    params: &Params,
    acc: &Accumulation,
    ap: bool,
    iou_thr: Option<f64>,
    area: &str,
    max_det: usize,
) -> f64 {
    let (title, kind) = if ap {
        ("Average Precision", "(AP)")
    } else {
        ("Average Recall", "(AR)")
    };
    let iou_text = match iou_thr {
        Some(thr) => format!("{:0.2}", thr),
        None => format!(
            "{:0.2}:{:0.2}",
            params.iou_thrs.first().copied().unwrap_or(0.0),
            params.iou_thrs.last().copied().unwrap_or(0.0)
        ),
    };

    let t_indices: Vec<usize> = params
        .iou_thrs
        .iter()
        .enumerate()
        .filter(|(_, thr)| iou_thr.map(|target| (*thr - target).abs() < 1e-9).unwrap_or(true))
        .map(|(t, _)| t)
        .collect();
    let a_indices: Vec<usize> = params
        .area_rngs
        .iter()
        .positions(|range| range.label == area)
        .collect();
    let m_indices: Vec<usize> = params
        .max_dets
        .iter()
        .positions(|&value| value == max_det)
        .collect();

    let values: Vec<f64> = if ap {
        iproduct!(
            t_indices.iter().copied(),
            0..acc.num_rec,
            0..acc.num_cat,
            a_indices.iter().copied(),
            m_indices.iter().copied()
        )
        .map(|(t, r, k, a, m)| acc.precision[acc.precision_index(t, r, k, a, m)])
        .collect()
    } else {
        iproduct!(
            t_indices.iter().copied(),
            0..acc.num_cat,
            a_indices.iter().copied(),
            m_indices.iter().copied()
        )
        .map(|(t, k, a, m)| acc.recall[acc.recall_index(t, k, a, m)])
        .collect()
    };

    let valid: Vec<f64> = values.into_iter().filter(|&value| value > -1.0).collect();
    let mean = if valid.is_empty() {
        -1.0
    } else {
        valid.iter().sum::<f64>() / valid.len() as f64
    };

    info!(
        " {:<18} {} @[ IoU={:<9} | area={:>6} | maxDets={:>3} ] = {:0.3}",
        title, kind, iou_text, area, max_det, mean
    );
    mean
}

fn result_bbox(result: &ResultAnnotation) -> Result<[f64; 4]> {
    match (&result.bbox, &result.segmentation) {
        (Some(bbox), _) => Ok(*bbox),
        (None, Some(rle)) => Ok(rle.to_bbox()),
        (None, None) => bail!(
            "result on image {} has neither bbox nor segmentation",
            result.image_id
        ),
    }
}

fn result_mask(result: &ResultAnnotation, height: usize, width: usize) -> Result<Rle> {
    match (&result.segmentation, result.bbox) {
        (Some(rle), _) => {
            ensure!(
                rle.height == height && rle.width == width,
                "mask size {}x{} does not match the image size {}x{}",
                rle.height,
                rle.width,
                height,
                width
            );
            Ok(rle.clone())
        }
        (None, Some([x, y, w, h])) => {
            let polygon = [x, y, x, y + h, x + w, y + h, x + w, y];
            Ok(Rle::from_polygon(&polygon, height, width))
        }
        (None, None) => bail!(
            "result on image {} has neither bbox nor segmentation",
            result.image_id
        ),
    }
}
