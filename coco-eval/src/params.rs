use crate::common::*;

/// The kind of geometry compared by the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IouType {
    Bbox,
    Segm,
}

impl fmt::Display for IouType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Bbox => "bbox",
            Self::Segm => "segm",
        };
        write!(f, "{}", text)
    }
}

impl std::str::FromStr for IouType {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let iou_type = match text {
            "bbox" => Self::Bbox,
            "segm" => Self::Segm,
            _ => bail!("unsupported IoU type '{}'", text),
        };
        Ok(iou_type)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaRange {
    pub label: String,
    pub min: f64,
    pub max: f64,
}

impl AreaRange {
    pub fn new(label: &str, min: f64, max: f64) -> Self {
        Self {
            label: label.to_string(),
            min,
            max,
        }
    }

    pub fn contains(&self, area: f64) -> bool {
        area >= self.min && area <= self.max
    }
}

/// Evaluation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Params {
    pub cat_ids: Vec<i64>,
    pub iou_thrs: Vec<f64>,
    pub rec_thrs: Vec<f64>,
    pub max_dets: Vec<usize>,
    pub area_rngs: Vec<AreaRange>,
}

impl Params {
    /// The standard COCO detection setting over the given categories.
    pub fn new(cat_ids: impl IntoIterator<Item = i64>) -> Self {
        let cat_ids: Vec<_> = cat_ids.into_iter().sorted().dedup().collect();
        let max_area = 1e5f64.powi(2);

        Self {
            cat_ids,
            iou_thrs: linspace(0.5, 0.95, 10),
            rec_thrs: linspace(0.0, 1.0, 101),
            max_dets: vec![1, 10, 100],
            area_rngs: vec![
                AreaRange::new("all", 0.0, max_area),
                AreaRange::new("small", 0.0, 32f64.powi(2)),
                AreaRange::new("medium", 32f64.powi(2), 96f64.powi(2)),
                AreaRange::new("large", 96f64.powi(2), max_area),
            ],
        }
    }

    pub fn max_det(&self) -> usize {
        self.max_dets.iter().copied().max().unwrap_or(0)
    }
}

/// Evenly spaced values over `[start, stop]` with the end point pinned.
pub fn linspace(start: f64, stop: f64, num: usize) -> Vec<f64> {
    match num {
        0 => vec![],
        1 => vec![start],
        _ => {
            let step = (stop - start) / (num - 1) as f64;
            let mut values: Vec<_> = (0..num).map(|index| start + index as f64 * step).collect();
            values[num - 1] = stop;
            values
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn standard_params() {
        let params = Params::new([3, 1, 2, 1]);
        assert_eq!(params.cat_ids, vec![1, 2, 3]);
        assert_eq!(params.iou_thrs.len(), 10);
        assert_eq!(params.rec_thrs.len(), 101);
        assert_eq!(params.max_det(), 100);
        assert_abs_diff_eq!(params.iou_thrs[5], 0.75, epsilon = 1e-12);
        assert_eq!(params.iou_thrs[9], 0.95);
        assert_abs_diff_eq!(params.rec_thrs[37], 0.37, epsilon = 1e-12);
        assert!(params.area_rngs[1].contains(1024.0));
        assert!(params.area_rngs[2].contains(1024.0));
        assert!(!params.area_rngs[3].contains(1024.0));
    }

    #[test]
    fn iou_type_text() {
        assert_eq!("segm".parse::<IouType>().unwrap(), IouType::Segm);
        assert_eq!(IouType::Bbox.to_string(), "bbox");
        assert!("keypoints".parse::<IouType>().is_err());
    }
}
