//! Run-length encoded binary masks in the COCO layout.
//!
//! Pixels are visited in column-major order and the runs alternate between
//! background and foreground, starting with background. A mask that begins
//! with a foreground pixel therefore has a leading zero-length run.

use crate::common::*;

/// A run-length encoded binary mask.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RleJson", into = "RleJson")]
pub struct Rle {
    pub height: usize,
    pub width: usize,
    pub counts: Vec<u32>,
}

impl Rle {
    /// Encodes a column-major mask. Non-zero values are foreground.
    pub fn encode(mask: &[u8], height: usize, width: usize) -> Result<Self> {
        ensure!(
            mask.len() == height * width,
            "expect {} mask values for size {}x{}, but get {}",
            height * width,
            height,
            width,
            mask.len()
        );

        let mut counts = vec![];
        let mut prev = false;
        let mut run = 0;

        for &value in mask {
            let value = value != 0;
            if value != prev {
                counts.push(run);
                run = 0;
                prev = value;
            }
            run += 1;
        }
        counts.push(run);

        Ok(Self {
            height,
            width,
            counts,
        })
    }

    /// Encodes a row-major mask, the layout of image tensors.
    pub fn encode_row_major(mask: &[u8], height: usize, width: usize) -> Result<Self> {
        ensure!(
            mask.len() == height * width,
            "expect {} mask values for size {}x{}, but get {}",
            height * width,
            height,
            width,
            mask.len()
        );

        let col_major: Vec<u8> = iproduct!(0..width, 0..height)
            .map(|(x, y)| mask[y * width + x])
            .collect();
        Self::encode(&col_major, height, width)
    }

    /// Expands the runs into a column-major mask of zeros and ones.
    pub fn decode(&self) -> Vec<u8> {
        let mut mask = Vec::with_capacity(self.height * self.width);
        let mut value = 0;

        for &count in &self.counts {
            mask.extend(iter::repeat(value).take(count as usize));
            value = 1 - value;
        }

        mask
    }

    /// Number of foreground pixels.
    pub fn area(&self) -> u64 {
        self.counts
            .iter()
            .skip(1)
            .step_by(2)
            .map(|&count| count as u64)
            .sum()
    }

    /// The tight bounding box in `[x, y, w, h]` form.
    pub fn to_bbox(&self) -> [f64; 4] {
        let h = self.height as u64;
        let w = self.width as u64;
        let m = self.counts.len() / 2 * 2;

        if m == 0 || h == 0 {
            return [0.0; 4];
        }

        let (mut xs, mut ys, mut xe, mut ye) = (w, h, 0, 0);
        let mut cc = 0u64;
        let mut xp = 0u64;

        for (index, &count) in self.counts[..m].iter().enumerate() {
            cc += count as u64;
            let t = cc - (index % 2) as u64;
            let y = t % h;
            let x = (t - y) / h;

            if index % 2 == 0 {
                xp = x;
            } else if xp < x {
                // the run wraps around a column
                ys = 0;
                ye = h - 1;
            }

            xs = xs.min(x);
            xe = xe.max(x);
            ys = ys.min(y);
            ye = ye.max(y);
        }

        [
            xs as f64,
            ys as f64,
            (xe - xs + 1) as f64,
            (ye - ys + 1) as f64,
        ]
    }

    /// Rasterizes a polygon given as `[x0, y0, x1, y1, ...]` in pixel units.
    ///
    /// The boundary is traced on a 5x upsampled grid and sampled back at
    /// pixel centers, which reproduces the reference COCO rasterizer.
    pub fn from_polygon(polygon: &[f64], height: usize, width: usize) -> Self {
        const SCALE: f64 = 5.0;

        let (h, w) = (height as i64, width as i64);
        let num_points = polygon.len() / 2;

        let mut xs: Vec<i64> = (0..num_points)
            .map(|index| (SCALE * polygon[index * 2] + 0.5) as i64)
            .collect();
        let mut ys: Vec<i64> = (0..num_points)
            .map(|index| (SCALE * polygon[index * 2 + 1] + 0.5) as i64)
            .collect();

        if let (Some(&x0), Some(&y0)) = (xs.first(), ys.first()) {
            xs.push(x0);
            ys.push(y0);
        }

        // densely sample the upsampled boundary
        let mut us = vec![];
        let mut vs = vec![];

        for index in 0..num_points {
            let (mut xs_, mut xe) = (xs[index], xs[index + 1]);
            let (mut ys_, mut ye) = (ys[index], ys[index + 1]);
            let dx = (xe - xs_).abs();
            let dy = (ys_ - ye).abs();
            let flip = (dx >= dy && xs_ > xe) || (dx < dy && ys_ > ye);

            if flip {
                std::mem::swap(&mut xs_, &mut xe);
                std::mem::swap(&mut ys_, &mut ye);
            }

            let slope = match (dx >= dy, dx, dy) {
                (true, 0, _) => 0.0,
                (true, dx, _) => (ye - ys_) as f64 / dx as f64,
                (false, _, dy) => (xe - xs_) as f64 / dy as f64,
            };

            if dx >= dy {
                for d in 0..=dx {
                    let t = if flip { dx - d } else { d };
                    us.push(t + xs_);
                    vs.push((ys_ as f64 + slope * t as f64 + 0.5) as i64);
                }
            } else {
                for d in 0..=dy {
                    let t = if flip { dy - d } else { d };
                    vs.push(t + ys_);
                    us.push((xs_ as f64 + slope * t as f64 + 0.5) as i64);
                }
            }
        }

        // keep the points on the y-boundary and downsample them
        let mut boundary = vec![];

        for index in 1..us.len() {
            if us[index] == us[index - 1] {
                continue;
            }

            let xd = if us[index] < us[index - 1] {
                us[index]
            } else {
                us[index] - 1
            } as f64;
            let xd = (xd + 0.5) / SCALE - 0.5;
            if xd.floor() != xd || xd < 0.0 || xd > (w - 1) as f64 {
                continue;
            }

            let yd = vs[index].min(vs[index - 1]) as f64;
            let yd = (yd + 0.5) / SCALE - 0.5;
            let yd = yd.clamp(0.0, h as f64).ceil();

            boundary.push(xd as i64 * h + yd as i64);
        }

        // turn the sorted boundary positions into runs
        boundary.push(h * w);
        boundary.sort_unstable();

        let mut prev = 0;
        let diffs: Vec<i64> = boundary
            .into_iter()
            .map(|pos| {
                let diff = pos - prev;
                prev = pos;
                diff
            })
            .collect();

        let mut counts: Vec<u32> = vec![];
        let mut iter = diffs.into_iter();

        if let Some(first) = iter.next() {
            counts.push(first as u32);
        }

        while let Some(diff) = iter.next() {
            if diff > 0 {
                counts.push(diff as u32);
            } else if let Some(next) = iter.next() {
                // a zero-length run merges its neighbors
                if let Some(last) = counts.last_mut() {
                    *last += next as u32;
                }
            }
        }

        Self {
            height,
            width,
            counts,
        }
    }

    /// Rasterizes a list of polygons into a single mask.
    pub fn from_polygons(
        polygons: &[impl AsRef<[f64]>],
        height: usize,
        width: usize,
    ) -> Result<Self> {
        let rles: Vec<_> = polygons
            .iter()
            .map(|polygon| Self::from_polygon(polygon.as_ref(), height, width))
            .collect();
        Self::merge(&rles, false)
    }

    /// Computes the union, or the intersection if `intersect` is set, of masks
    /// of the same size.
    pub fn merge(rles: &[Self], intersect: bool) -> Result<Self> {
        let (first, rest) = match rles.split_first() {
            Some(pair) => pair,
            None => {
                return Ok(Self {
                    height: 0,
                    width: 0,
                    counts: vec![],
                })
            }
        };

        let mut counts = first.counts.clone();

        for other in rest {
            ensure!(
                other.height == first.height && other.width == first.width,
                "cannot merge masks of size {}x{} and {}x{}",
                first.height,
                first.width,
                other.height,
                other.width
            );

            let lhs = counts;
            let rhs = &other.counts;
            let mut merged = vec![];

            let mut ca = lhs.first().copied().unwrap_or(0) as u64;
            let mut cb = rhs.first().copied().unwrap_or(0) as u64;
            let (mut v, mut va, mut vb) = (false, false, false);
            let (mut ia, mut ib) = (1, 1);
            let mut cc = 0u64;
            let mut ct = 1u64;

            while ct > 0 {
                let c = ca.min(cb);
                cc += c;
                ct = 0;

                ca -= c;
                if ca == 0 && ia < lhs.len() {
                    ca = lhs[ia] as u64;
                    ia += 1;
                    va = !va;
                }
                ct += ca;

                cb -= c;
                if cb == 0 && ib < rhs.len() {
                    cb = rhs[ib] as u64;
                    ib += 1;
                    vb = !vb;
                }
                ct += cb;

                let vp = v;
                v = if intersect { va && vb } else { va || vb };

                if v != vp || ct == 0 {
                    merged.push(cc as u32);
                    cc = 0;
                }
            }

            counts = merged;
        }

        Ok(Self {
            height: first.height,
            width: first.width,
            counts,
        })
    }

    /// Serializes the runs into the compact COCO string form.
    pub fn to_compressed_string(&self) -> String {
        let mut text = String::new();

        for (index, &count) in self.counts.iter().enumerate() {
            let mut x = count as i64;
            if index > 2 {
                x -= self.counts[index - 2] as i64;
            }

            loop {
                let mut c = x & 0x1f;
                x >>= 5;
                let more = if c & 0x10 != 0 { x != -1 } else { x != 0 };
                if more {
                    c |= 0x20;
                }
                text.push((c + 48) as u8 as char);

                if !more {
                    break;
                }
            }
        }

        text
    }

    /// Parses the compact COCO string form.
    pub fn from_compressed_string(text: &str, height: usize, width: usize) -> Result<Self> {
        let bytes = text.as_bytes();
        let mut counts: Vec<u32> = vec![];
        let mut pos = 0;

        while pos < bytes.len() {
            let mut x = 0i64;
            let mut k = 0;

            loop {
                let byte = *bytes
                    .get(pos)
                    .ok_or_else(|| format_err!("truncated RLE string '{}'", text))?;
                ensure!(k < 12, "malformed RLE string '{}'", text);

                let c = byte as i64 - 48;
                x |= (c & 0x1f) << (5 * k);
                pos += 1;
                k += 1;

                if c & 0x20 == 0 {
                    if c & 0x10 != 0 {
                        x |= -1i64 << (5 * k);
                    }
                    break;
                }
            }

            if counts.len() > 2 {
                x += counts[counts.len() - 2] as i64;
            }
            ensure!(x >= 0, "malformed RLE string '{}'", text);
            counts.push(x as u32);
        }

        Ok(Self {
            height,
            width,
            counts,
        })
    }
}

/// Pairwise IoU between detected and ground truth masks.
///
/// The output is indexed by `[detection][ground_truth]`. For crowd ground
/// truth the union is replaced by the area of the detection.
pub fn mask_iou(dts: &[Rle], gts: &[Rle], iscrowd: &[bool]) -> Vec<Vec<f64>> {
    let dt_bboxes: Vec<_> = dts.iter().map(Rle::to_bbox).collect();
    let gt_bboxes: Vec<_> = gts.iter().map(Rle::to_bbox).collect();
    let no_crowd = vec![false; gts.len()];
    let bbox_ious = bbox_iou(&dt_bboxes, &gt_bboxes, &no_crowd);

    dts.iter()
        .zip(bbox_ious)
        .map(|(dt, bbox_ious)| {
            gts.iter()
                .zip(bbox_ious)
                .enumerate()
                .map(|(gt_index, (gt, bbox_iou))| {
                    if bbox_iou <= 0.0 {
                        return 0.0;
                    }
                    if dt.height != gt.height || dt.width != gt.width {
                        return -1.0;
                    }

                    let crowd = iscrowd.get(gt_index).copied().unwrap_or(false);
                    let (inter, union) = intersection_union(dt, gt);
                    let union = if inter == 0 {
                        1
                    } else if crowd {
                        dt.area()
                    } else {
                        union
                    };
                    inter as f64 / union as f64
                })
                .collect()
        })
        .collect()
}

/// Pairwise IoU between `[x, y, w, h]` boxes, indexed by
/// `[detection][ground_truth]`.
pub fn bbox_iou(dts: &[[f64; 4]], gts: &[[f64; 4]], iscrowd: &[bool]) -> Vec<Vec<f64>> {
    dts.iter()
        .map(|db| {
            let da = db[2] * db[3];

            gts.iter()
                .enumerate()
                .map(|(gt_index, gb)| {
                    let ga = gb[2] * gb[3];
                    let crowd = iscrowd.get(gt_index).copied().unwrap_or(false);

                    let w = (db[0] + db[2]).min(gb[0] + gb[2]) - db[0].max(gb[0]);
                    if w <= 0.0 {
                        return 0.0;
                    }
                    let h = (db[1] + db[3]).min(gb[1] + gb[3]) - db[1].max(gb[1]);
                    if h <= 0.0 {
                        return 0.0;
                    }

                    let inter = w * h;
                    let union = if crowd { da } else { da + ga - inter };
                    inter / union
                })
                .collect()
        })
        .collect()
}

fn intersection_union(lhs: &Rle, rhs: &Rle) -> (u64, u64) {
    let mut ca = lhs.counts.first().copied().unwrap_or(0) as u64;
    let mut cb = rhs.counts.first().copied().unwrap_or(0) as u64;
    let (mut va, mut vb) = (false, false);
    let (mut ia, mut ib) = (1, 1);
    let (mut inter, mut union) = (0u64, 0u64);
    let mut ct = 1u64;

    while ct > 0 {
        let c = ca.min(cb);
        if va || vb {
            union += c;
            if va && vb {
                inter += c;
            }
        }
        ct = 0;

        ca -= c;
        if ca == 0 && ia < lhs.counts.len() {
            ca = lhs.counts[ia] as u64;
            ia += 1;
            va = !va;
        }
        ct += ca;

        cb -= c;
        if cb == 0 && ib < rhs.counts.len() {
            cb = rhs.counts[ib] as u64;
            ib += 1;
            vb = !vb;
        }
        ct += cb;
    }

    (inter, union)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RleJson {
    size: [usize; 2],
    counts: RleCounts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RleCounts {
    Compressed(String),
    Uncompressed(Vec<u32>),
}

impl TryFrom<RleJson> for Rle {
    type Error = Error;

    fn try_from(from: RleJson) -> Result<Self, Self::Error> {
        let RleJson {
            size: [height, width],
            counts,
        } = from;

        match counts {
            RleCounts::Compressed(text) => Self::from_compressed_string(&text, height, width),
            RleCounts::Uncompressed(counts) => Ok(Self {
                height,
                width,
                counts,
            }),
        }
    }
}

impl From<Rle> for RleJson {
    fn from(from: Rle) -> Self {
        Self {
            size: [from.height, from.width],
            counts: RleCounts::Compressed(from.to_compressed_string()),
        }
    }
}
