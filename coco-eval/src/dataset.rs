//! COCO ground truth and detection result files.

use crate::{common::*, mask::Rle};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageInfo {
    pub id: i64,
    #[serde(default)]
    pub file_name: String,
    pub height: usize,
    pub width: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supercategory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isthing: Option<u8>,
}

impl Category {
    pub fn is_thing(&self) -> bool {
        self.isthing.map(|flag| flag != 0).unwrap_or(true)
    }
}

/// Object segmentation as stored in COCO files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Segmentation {
    Polygons(Vec<Vec<f64>>),
    Rle(Rle),
}

impl Segmentation {
    pub fn to_rle(&self, height: usize, width: usize) -> Result<Rle> {
        let rle = match self {
            Self::Polygons(polygons) => Rle::from_polygons(polygons.as_slice(), height, width)?,
            Self::Rle(rle) => {
                ensure!(
                    rle.height == height && rle.width == width,
                    "mask size {}x{} does not match the image size {}x{}",
                    rle.height,
                    rle.width,
                    height,
                    width
                );
                rle.clone()
            }
        };
        Ok(rle)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Annotation {
    pub id: i64,
    pub image_id: i64,
    pub category_id: i64,
    pub bbox: [f64; 4],
    pub area: f64,
    #[serde(default)]
    pub iscrowd: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segmentation: Option<Segmentation>,
}

impl Annotation {
    pub fn is_crowd(&self) -> bool {
        self.iscrowd != 0
    }
}

/// One entry of a COCO results file.
///
/// Boxes are `[x, y, w, h]` in absolute pixels. Box results carry `bbox`,
/// mask results carry `segmentation`, and either may carry both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultAnnotation {
    pub image_id: i64,
    pub category_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[f64; 4]>,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segmentation: Option<Rle>,
}

impl ResultAnnotation {
    /// Loads a results JSON array.
    pub fn open_many(path: impl AsRef<Path>) -> Result<Vec<Self>> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read results file '{}'", path.display()))?;
        let results = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse results file '{}'", path.display()))?;
        Ok(results)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DatasetJson {
    images: Vec<ImageInfo>,
    #[serde(default)]
    annotations: Vec<Annotation>,
    categories: Vec<Category>,
}

/// A COCO ground truth dataset indexed by image and category.
#[derive(Debug, Clone)]
pub struct CocoDataset {
    images: IndexMap<i64, ImageInfo>,
    categories: IndexMap<i64, Category>,
    annotations: Vec<Annotation>,
    index: HashMap<(i64, i64), Vec<usize>>,
}

impl CocoDataset {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read dataset file '{}'", path.display()))?;
        let json: DatasetJson = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse dataset file '{}'", path.display()))?;
        Self::new(json.images, json.categories, json.annotations)
    }

    pub fn new(
        images: Vec<ImageInfo>,
        categories: Vec<Category>,
        annotations: Vec<Annotation>,
    ) -> Result<Self> {
        let images: IndexMap<_, _> = images.into_iter().map(|image| (image.id, image)).collect();
        let categories: IndexMap<_, _> = categories
            .into_iter()
            .map(|category| (category.id, category))
            .collect();

        let mut index: HashMap<(i64, i64), Vec<usize>> = HashMap::new();
        for (ann_index, ann) in annotations.iter().enumerate() {
            ensure!(
                images.contains_key(&ann.image_id),
                "annotation {} refers to unknown image {}",
                ann.id,
                ann.image_id
            );
            ensure!(
                categories.contains_key(&ann.category_id),
                "annotation {} refers to unknown category {}",
                ann.id,
                ann.category_id
            );
            index
                .entry((ann.image_id, ann.category_id))
                .or_default()
                .push(ann_index);
        }

        Ok(Self {
            images,
            categories,
            annotations,
            index,
        })
    }

    pub fn image(&self, image_id: i64) -> Option<&ImageInfo> {
        self.images.get(&image_id)
    }

    pub fn category(&self, category_id: i64) -> Option<&Category> {
        self.categories.get(&category_id)
    }

    /// Sorted image ids.
    pub fn image_ids(&self) -> Vec<i64> {
        self.images.keys().copied().sorted().collect()
    }

    /// Sorted category ids.
    pub fn category_ids(&self) -> Vec<i64> {
        self.categories.keys().copied().sorted().collect()
    }

    pub fn annotations(&self, image_id: i64, category_id: i64) -> impl Iterator<Item = &Annotation> {
        self.index
            .get(&(image_id, category_id))
            .into_iter()
            .flatten()
            .map(move |&index| &self.annotations[index])
    }

    pub fn all_annotations(&self) -> &[Annotation] {
        &self.annotations
    }

    /// Rasterizes the segmentation of a ground truth annotation.
    pub fn annotation_rle(&self, ann: &Annotation) -> Result<Rle> {
        let image = self
            .image(ann.image_id)
            .ok_or_else(|| format_err!("unknown image {}", ann.image_id))?;
        let segmentation = ann
            .segmentation
            .as_ref()
            .ok_or_else(|| format_err!("annotation {} has no segmentation", ann.id))?;
        segmentation.to_rle(image.height, image.width)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_dataset_json() {
        let text = r#"{
            "images": [{"id": 7, "file_name": "a.jpg", "height": 4, "width": 4}],
            "categories": [{"id": 1, "name": "cat"}, {"id": 2, "name": "sky", "isthing": 0}],
            "annotations": [
                {"id": 1, "image_id": 7, "category_id": 1, "bbox": [0, 0, 2, 2], "area": 4,
                 "segmentation": [[0, 0, 2, 0, 2, 2, 0, 2]]},
                {"id": 2, "image_id": 7, "category_id": 2, "bbox": [0, 0, 4, 4], "area": 16,
                 "iscrowd": 1, "segmentation": {"size": [4, 4], "counts": [0, 16]}}
            ]
        }"#;
        let json: DatasetJson = serde_json::from_str(text).unwrap();
        let dataset = CocoDataset::new(json.images, json.categories, json.annotations).unwrap();

        assert_eq!(dataset.image_ids(), vec![7]);
        assert_eq!(dataset.category_ids(), vec![1, 2]);
        assert!(dataset.category(1).unwrap().is_thing());
        assert!(!dataset.category(2).unwrap().is_thing());

        let crowd = dataset.annotations(7, 2).next().unwrap();
        assert!(crowd.is_crowd());
        assert_eq!(dataset.annotation_rle(crowd).unwrap().area(), 16);

        let polygon = dataset.annotations(7, 1).next().unwrap();
        assert_eq!(dataset.annotation_rle(polygon).unwrap().area(), 4);
        assert_eq!(dataset.annotations(7, 3).count(), 0);
    }
}
