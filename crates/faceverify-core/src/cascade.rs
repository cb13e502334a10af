//! Haar feature cascade (Viola-Jones) face detection.
//!
//! Evaluates stump-based boosted cascades over an image pyramid using
//! integral images, then clusters raw hits into faces. Cascades are read
//! from OpenCV's `opencv_storage` XML (stump-based BOOST/HAAR) or from an
//! equivalent JSON layout with identical rect, threshold and leaf-value
//! semantics.

use crate::detector::DetectorParams;
use crate::types::Rect;
use image::imageops::{self, FilterType};
use image::GrayImage;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Windows whose pixel standard deviation is at or below this are rejected as flat.
const MIN_WINDOW_STDDEV: f64 = 10.0;
/// Relative tolerance used when clustering raw detections.
pub const GROUP_EPS: f64 = 0.2;
const MIN_WINDOW_SIDE: u32 = 3;
/// OpenCV lowers every stage threshold read from XML by this amount.
const XML_STAGE_THRESHOLD_EPS: f32 = 1e-5;

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("cascade file not found: {0}")]
    NotFound(String),
    #[error("cannot read cascade: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed cascade JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("malformed cascade XML: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("unsupported cascade: {0}")]
    Unsupported(String),
    #[error("invalid cascade: {0}")]
    Invalid(String),
}

/// One rectangle of a Haar feature with its weight, `[x, y, w, h, weight]` on disk.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(from = "(i32, i32, i32, i32, f32)")]
pub struct WeightedRect {
    pub rect: Rect,
    pub weight: f32,
}

impl From<(i32, i32, i32, i32, f32)> for WeightedRect {
    fn from((x, y, width, height, weight): (i32, i32, i32, i32, f32)) -> Self {
        Self { rect: Rect::new(x, y, width, height), weight }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HaarFeature {
    pub rects: Vec<WeightedRect>,
    #[serde(default)]
    pub tilted: bool,
}

/// Decision stump over a single feature.
#[derive(Debug, Clone, Deserialize)]
pub struct WeakClassifier {
    pub feature: usize,
    pub threshold: f32,
    pub left: f32,
    pub right: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Stage {
    pub threshold: f32,
    pub classifiers: Vec<WeakClassifier>,
}

/// A trained frontal-face cascade.
#[derive(Debug, Clone, Deserialize)]
pub struct HaarCascade {
    /// Base window width in pixels.
    pub width: u32,
    /// Base window height in pixels.
    pub height: u32,
    pub features: Vec<HaarFeature>,
    pub stages: Vec<Stage>,
}

impl HaarCascade {
    /// Load and validate a cascade file, OpenCV XML or JSON.
    pub fn load(path: &Path) -> Result<Self, CascadeError> {
        if !path.exists() {
            return Err(CascadeError::NotFound(path.display().to_string()));
        }

        let text = std::fs::read_to_string(path)?;
        let cascade = Self::parse(&text)?;

        tracing::info!(
            path = %path.display(),
            window = ?(cascade.width, cascade.height),
            stages = cascade.stages.len(),
            features = cascade.features.len(),
            "loaded Haar cascade"
        );

        Ok(cascade)
    }

    /// Parse either format, picked by the first non-blank character.
    pub fn parse(text: &str) -> Result<Self, CascadeError> {
        if text.trim_start().starts_with('<') {
            Self::from_xml(text)
        } else {
            Self::from_json(text)
        }
    }

    pub fn from_json(text: &str) -> Result<Self, CascadeError> {
        let cascade: HaarCascade = serde_json::from_str(text)?;
        cascade.validate()?;
        Ok(cascade)
    }

    /// Parse an OpenCV cascade as written by `opencv_traincascade`, e.g.
    /// `haarcascade_frontalface_default.xml`.
    pub fn from_xml(text: &str) -> Result<Self, CascadeError> {
        let doc = roxmltree::Document::parse(text)?;
        let root = doc.root_element();
        if !root.has_tag_name("opencv_storage") {
            return Err(CascadeError::Unsupported(format!(
                "root element is <{}>, expected <opencv_storage>",
                root.tag_name().name()
            )));
        }
        let node = xml::child(root, "cascade").map_err(|_| {
            CascadeError::Unsupported("no <cascade> element (old-style Haar XML is not supported)".into())
        })?;

        for (tag, expected) in [("stageType", "BOOST"), ("featureType", "HAAR")] {
            let found = xml::text(node, tag)?;
            if found != expected {
                return Err(CascadeError::Unsupported(format!("{tag} {found}, expected {expected}")));
            }
        }

        let width = xml::number(node, "width")?;
        let height = xml::number(node, "height")?;

        let mut features = Vec::new();
        for feature in xml::elements(xml::child(node, "features")?) {
            let mut rects = Vec::new();
            for rect in xml::elements(xml::child(feature, "rects")?) {
                let values: Vec<f32> = xml::numbers(rect.text().unwrap_or_default(), "rect")?;
                let &[x, y, w, h, weight] = values.as_slice() else {
                    return Err(CascadeError::Invalid(format!(
                        "rect needs 5 values, got {}",
                        values.len()
                    )));
                };
                rects.push(WeightedRect::from((x as i32, y as i32, w as i32, h as i32, weight)));
            }
            let tilted = match xml::child(feature, "tilted") {
                Ok(t) => t.text().map(str::trim) == Some("1"),
                Err(_) => false,
            };
            features.push(HaarFeature { rects, tilted });
        }

        let mut stages = Vec::new();
        for stage in xml::elements(xml::child(node, "stages")?) {
            let threshold: f32 = xml::number(stage, "stageThreshold")?;
            let mut classifiers = Vec::new();
            for weak in xml::elements(xml::child(stage, "weakClassifiers")?) {
                let nodes: Vec<f64> = xml::numbers(xml::text(weak, "internalNodes")?, "internalNodes")?;
                let leaves: Vec<f32> = xml::numbers(xml::text(weak, "leafValues")?, "leafValues")?;
                // A stump is one node `0 -1 feature threshold` with two leaves.
                match (&nodes[..], &leaves[..]) {
                    (&[l, r, feature, threshold], &[left, right])
                        if l == 0.0 && r == -1.0 && feature >= 0.0 =>
                    {
                        classifiers.push(WeakClassifier {
                            feature: feature as usize,
                            threshold: threshold as f32,
                            left,
                            right,
                        });
                    }
                    _ => {
                        return Err(CascadeError::Unsupported(
                            "only single-split (stump) weak classifiers are supported".into(),
                        ))
                    }
                }
            }
            stages.push(Stage { threshold: threshold - XML_STAGE_THRESHOLD_EPS, classifiers });
        }

        let cascade = HaarCascade { width, height, features, stages };
        cascade.validate()?;
        Ok(cascade)
    }

    /// Check structural invariants the evaluator relies on.
    pub fn validate(&self) -> Result<(), CascadeError> {
        let invalid = |msg: String| Err(CascadeError::Invalid(msg));

        if self.width < MIN_WINDOW_SIDE || self.height < MIN_WINDOW_SIDE {
            return invalid(format!(
                "window {}x{} is smaller than {MIN_WINDOW_SIDE}x{MIN_WINDOW_SIDE}",
                self.width, self.height
            ));
        }
        if self.stages.is_empty() {
            return invalid("cascade has no stages".into());
        }

        for (i, feature) in self.features.iter().enumerate() {
            if feature.tilted {
                return invalid(format!("feature {i}: tilted features are not supported"));
            }
            if !(2..=3).contains(&feature.rects.len()) {
                return invalid(format!(
                    "feature {i}: expected 2 or 3 rects, got {}",
                    feature.rects.len()
                ));
            }
            for wr in &feature.rects {
                let r = wr.rect;
                if r.x < 0
                    || r.y < 0
                    || r.width <= 0
                    || r.height <= 0
                    || r.right() > self.width as i32
                    || r.bottom() > self.height as i32
                {
                    return invalid(format!("feature {i}: rect {r:?} leaves the window"));
                }
            }
        }

        for (s, stage) in self.stages.iter().enumerate() {
            if stage.classifiers.is_empty() {
                return invalid(format!("stage {s} has no classifiers"));
            }
            if let Some(c) = stage.classifiers.iter().find(|c| c.feature >= self.features.len()) {
                return invalid(format!(
                    "stage {s}: feature index {} out of range ({} features)",
                    c.feature,
                    self.features.len()
                ));
            }
        }

        Ok(())
    }

    /// Run every stage on the base-size window at `(x, y)` of an integral image.
    pub fn evaluate(&self, ii: &IntegralImage, x: u32, y: u32) -> bool {
        let (w, h) = (self.width, self.height);
        // Normalization region is the window inset by one pixel.
        let area = ((w - 2) * (h - 2)) as f64;
        let sum = ii.sum(x + 1, y + 1, w - 2, h - 2) as f64;
        let sq_sum = ii.sq_sum(x + 1, y + 1, w - 2, h - 2) as f64;

        let nf = area * sq_sum - sum * sum;
        if nf <= 0.0 {
            return false;
        }
        let nf = nf.sqrt();
        // nf = area * stddev
        if nf / area <= MIN_WINDOW_STDDEV {
            return false;
        }

        for stage in &self.stages {
            let mut stage_sum = 0.0f64;
            for weak in &stage.classifiers {
                let value = self.feature_value(weak.feature, ii, x, y) / nf;
                stage_sum += if value < weak.threshold as f64 {
                    weak.left as f64
                } else {
                    weak.right as f64
                };
            }
            if stage_sum < stage.threshold as f64 {
                return false;
            }
        }

        true
    }

    fn feature_value(&self, feature: usize, ii: &IntegralImage, x: u32, y: u32) -> f64 {
        self.features[feature]
            .rects
            .iter()
            .map(|wr| {
                let r = wr.rect;
                let s = ii.sum(
                    x + r.x as u32,
                    y + r.y as u32,
                    r.width as u32,
                    r.height as u32,
                );
                wr.weight as f64 * s as f64
            })
            .sum()
    }

    /// Scan an image pyramid and return every accepted window in original coordinates.
    ///
    /// Raw hits are not grouped; see [`group_rectangles`].
    pub fn detect_multi_scale(&self, gray: &GrayImage, params: &DetectorParams) -> Vec<Rect> {
        let (img_w, img_h) = gray.dimensions();
        let mut hits = Vec::new();
        let mut factor = 1.0f64;

        loop {
            let win_w = (self.width as f64 * factor).round() as u32;
            let win_h = (self.height as f64 * factor).round() as u32;
            let scaled_w = (img_w as f64 / factor).round() as u32;
            let scaled_h = (img_h as f64 / factor).round() as u32;

            if scaled_w < self.width || scaled_h < self.height {
                break;
            }
            if params.max_size.is_some_and(|max| win_w > max || win_h > max) {
                break;
            }

            if win_w >= params.min_size && win_h >= params.min_size {
                let resized;
                let level = if scaled_w == img_w && scaled_h == img_h {
                    gray
                } else {
                    resized = imageops::resize(gray, scaled_w, scaled_h, FilterType::Triangle);
                    &resized
                };

                let ii = IntegralImage::new(level);
                let step = if factor > 2.0 { 1 } else { 2 };
                let before = hits.len();

                for y in (0..=scaled_h - self.height).step_by(step) {
                    for x in (0..=scaled_w - self.width).step_by(step) {
                        if self.evaluate(&ii, x, y) {
                            hits.push(Rect::new(
                                (x as f64 * factor).round() as i32,
                                (y as f64 * factor).round() as i32,
                                win_w as i32,
                                win_h as i32,
                            ));
                        }
                    }
                }

                tracing::trace!(factor, window = win_w, hits = hits.len() - before, "pyramid level");
            }

            factor *= params.scale_factor as f64;
        }

        hits
    }
}

/// Summed-area tables of pixel values and squared pixel values.
pub struct IntegralImage {
    /// Table width: image width + 1.
    stride: usize,
    sum: Vec<u64>,
    sq_sum: Vec<u64>,
}

impl IntegralImage {
    pub fn new(gray: &GrayImage) -> Self {
        let (w, h) = (gray.width() as usize, gray.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0u64; stride * (h + 1)];
        let mut sq_sum = vec![0u64; stride * (h + 1)];
        let raw = gray.as_raw();

        for y in 0..h {
            let mut row = 0u64;
            let mut row_sq = 0u64;
            for x in 0..w {
                let p = raw[y * w + x] as u64;
                row += p;
                row_sq += p * p;
                let idx = (y + 1) * stride + (x + 1);
                sum[idx] = sum[idx - stride] + row;
                sq_sum[idx] = sq_sum[idx - stride] + row_sq;
            }
        }

        Self { stride, sum, sq_sum }
    }

    /// Sum of pixels in the rectangle. Caller guarantees it lies inside the image.
    pub fn sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        Self::lookup(&self.sum, self.stride, x, y, w, h)
    }

    pub fn sq_sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        Self::lookup(&self.sq_sum, self.stride, x, y, w, h)
    }

    fn lookup(table: &[u64], stride: usize, x: u32, y: u32, w: u32, h: u32) -> u64 {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + w as usize, y0 + h as usize);
        (table[y1 * stride + x1] + table[y0 * stride + x0])
            - (table[y0 * stride + x1] + table[y1 * stride + x0])
    }
}

/// Small accessors over the `opencv_storage` tree.
mod xml {
    use super::CascadeError;
    use roxmltree::Node;
    use std::str::FromStr;

    pub(super) fn elements<'a, 'input>(node: Node<'a, 'input>) -> impl Iterator<Item = Node<'a, 'input>> {
        node.children().filter(|n| n.is_element())
    }

    pub(super) fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Result<Node<'a, 'input>, CascadeError> {
        elements(node).find(|n| n.has_tag_name(name)).ok_or_else(|| {
            CascadeError::Invalid(format!("<{}> has no <{name}>", node.tag_name().name()))
        })
    }

    pub(super) fn text<'a>(node: Node<'a, '_>, name: &str) -> Result<&'a str, CascadeError> {
        Ok(child(node, name)?.text().unwrap_or_default().trim())
    }

    pub(super) fn number<T: FromStr>(node: Node<'_, '_>, name: &str) -> Result<T, CascadeError> {
        let raw = text(node, name)?;
        raw.parse()
            .map_err(|_| CascadeError::Invalid(format!("<{name}> is not a number: {raw:?}")))
    }

    pub(super) fn numbers<T: FromStr>(raw: &str, what: &str) -> Result<Vec<T>, CascadeError> {
        raw.split_whitespace()
            .map(|v| {
                v.parse()
                    .map_err(|_| CascadeError::Invalid(format!("{what}: {v:?} is not a number")))
            })
            .collect()
    }
}

fn similar(a: &Rect, b: &Rect, eps: f64) -> bool {
    let delta = eps * (a.width.min(b.width) + a.height.min(b.height)) as f64 * 0.5;
    (a.x - b.x).abs() as f64 <= delta
        && (a.y - b.y).abs() as f64 <= delta
        && (a.right() - b.right()).abs() as f64 <= delta
        && (a.bottom() - b.bottom()).abs() as f64 <= delta
}

fn find_root(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

/// Cluster raw detections into faces.
///
/// Returns the averaged rectangle of each cluster with more than
/// `min_neighbors` members, together with its member count. Small clusters
/// nested inside stronger ones are dropped. With `min_neighbors == 0` the
/// raw rectangles come back untouched.
pub fn group_rectangles(rects: &[Rect], min_neighbors: u32, eps: f64) -> Vec<(Rect, u32)> {
    if min_neighbors == 0 {
        return rects.iter().map(|r| (*r, 1)).collect();
    }

    let n = rects.len();
    let mut parent: Vec<usize> = (0..n).collect();
    for i in 0..n {
        for j in (i + 1)..n {
            if similar(&rects[i], &rects[j], eps) {
                let (a, b) = (find_root(&mut parent, i), find_root(&mut parent, j));
                if a != b {
                    parent[b] = a;
                }
            }
        }
    }

    // root -> cluster slot, in order of first appearance
    let mut slot_of_root = vec![usize::MAX; n];
    let mut totals: Vec<([i64; 4], u32)> = Vec::new();
    for (i, r) in rects.iter().enumerate() {
        let root = find_root(&mut parent, i);
        if slot_of_root[root] == usize::MAX {
            slot_of_root[root] = totals.len();
            totals.push(([0; 4], 0));
        }
        let (acc, count) = &mut totals[slot_of_root[root]];
        acc[0] += r.x as i64;
        acc[1] += r.y as i64;
        acc[2] += r.width as i64;
        acc[3] += r.height as i64;
        *count += 1;
    }

    let clusters: Vec<(Rect, u32)> = totals
        .into_iter()
        .filter(|(_, count)| *count > min_neighbors)
        .map(|(acc, count)| {
            let avg = |v: i64| (v as f64 / count as f64).round_ties_even() as i32;
            (Rect::new(avg(acc[0]), avg(acc[1]), avg(acc[2]), avg(acc[3])), count)
        })
        .collect();

    clusters
        .iter()
        .enumerate()
        .filter(|&(i, &(inner, n_inner))| {
            !clusters.iter().enumerate().any(|(j, &(outer, n_outer))| {
                if i == j {
                    return false;
                }
                let dx = (outer.width as f64 * eps).round() as i32;
                let dy = (outer.height as f64 * eps).round() as i32;
                inner.x >= outer.x - dx
                    && inner.y >= outer.y - dy
                    && inner.right() <= outer.right() + dx
                    && inner.bottom() <= outer.bottom() + dy
                    && (n_outer > n_inner.max(3) || n_inner < 3)
            })
        })
        .map(|(_, c)| *c)
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::Luma;

    /// An 8x8 single-stage cascade that accepts windows whose left half is
    /// brighter than their right half.
    pub(crate) fn edge_cascade() -> HaarCascade {
        HaarCascade {
            width: 8,
            height: 8,
            features: vec![HaarFeature {
                rects: vec![
                    WeightedRect::from((0, 0, 8, 8, -1.0)),
                    WeightedRect::from((0, 0, 4, 8, 2.0)),
                ],
                tilted: false,
            }],
            stages: vec![Stage {
                threshold: 0.0,
                classifiers: vec![WeakClassifier {
                    feature: 0,
                    threshold: 0.0,
                    left: -1.0,
                    right: 1.0,
                }],
            }],
        }
    }

    /// Image split vertically at `split`, `left` value on the left, `right` on the right.
    pub(crate) fn split_image(w: u32, h: u32, split: u32, left: u8, right: u8) -> GrayImage {
        GrayImage::from_fn(w, h, |x, _| Luma([if x < split { left } else { right }]))
    }

    fn params(min_size: u32) -> DetectorParams {
        DetectorParams { scale_factor: 1.5, min_neighbors: 0, min_size, max_size: None }
    }

    #[test]
    fn test_integral_full_and_partial_sums() {
        let gray = GrayImage::from_fn(4, 3, |x, y| Luma([(x + y * 4) as u8]));
        let ii = IntegralImage::new(&gray);
        // 0 + 1 + ... + 11
        assert_eq!(ii.sum(0, 0, 4, 3), 66);
        // pixels (1,1),(2,1) = 5 + 6
        assert_eq!(ii.sum(1, 1, 2, 1), 11);
        assert_eq!(ii.sq_sum(1, 1, 2, 1), 25 + 36);
        assert_eq!(ii.sum(2, 2, 0, 0), 0);
    }

    #[test]
    fn test_evaluate_accepts_left_bright_window() {
        let cascade = edge_cascade();
        let ii = IntegralImage::new(&split_image(8, 8, 4, 200, 50));
        assert!(cascade.evaluate(&ii, 0, 0));
    }

    #[test]
    fn test_evaluate_rejects_right_bright_window() {
        let cascade = edge_cascade();
        let ii = IntegralImage::new(&split_image(8, 8, 4, 50, 200));
        assert!(!cascade.evaluate(&ii, 0, 0));
    }

    #[test]
    fn test_evaluate_rejects_flat_window() {
        let cascade = edge_cascade();
        let ii = IntegralImage::new(&GrayImage::from_pixel(8, 8, Luma([128])));
        assert!(!cascade.evaluate(&ii, 0, 0));
    }

    #[test]
    fn test_evaluate_rejects_low_contrast_window() {
        // Stddev of a 3/3 column split with values 100/110 is 5, below the floor.
        let cascade = edge_cascade();
        let ii = IntegralImage::new(&split_image(8, 8, 4, 110, 100));
        assert!(!cascade.evaluate(&ii, 0, 0));
    }

    #[test]
    fn test_detect_multi_scale_finds_edge() {
        let cascade = edge_cascade();
        let gray = split_image(64, 64, 32, 220, 30);
        let hits = cascade.detect_multi_scale(&gray, &params(0));
        assert!(!hits.is_empty());
        for r in &hits {
            let margin = r.width / 4;
            assert!(r.x <= 32 + margin && r.right() >= 32 - margin, "{r:?} misses the edge");
        }
        // Larger pyramid levels contribute larger windows.
        assert!(hits.iter().any(|r| r.width > 8));
    }

    #[test]
    fn test_detect_multi_scale_mirrored_edge_is_empty() {
        let cascade = edge_cascade();
        let gray = split_image(64, 64, 32, 30, 220);
        assert!(cascade.detect_multi_scale(&gray, &params(0)).is_empty());
    }

    #[test]
    fn test_detect_multi_scale_respects_size_limits() {
        let cascade = edge_cascade();
        let gray = split_image(64, 64, 32, 220, 30);

        assert!(cascade.detect_multi_scale(&gray, &params(100)).is_empty());

        let capped = DetectorParams { max_size: Some(12), ..params(10) };
        let hits = cascade.detect_multi_scale(&gray, &capped);
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|r| r.width == 12));
    }

    #[test]
    fn test_detect_multi_scale_image_smaller_than_window() {
        let cascade = edge_cascade();
        let gray = split_image(6, 6, 3, 220, 30);
        assert!(cascade.detect_multi_scale(&gray, &params(0)).is_empty());
    }

    #[test]
    fn test_from_json() {
        let json = r#"{
            "width": 8, "height": 8,
            "features": [ { "rects": [[0, 0, 8, 8, -1.0], [0, 0, 4, 8, 2.0]] } ],
            "stages": [ { "threshold": 0.0,
                          "classifiers": [ { "feature": 0, "threshold": 0.0, "left": -1.0, "right": 1.0 } ] } ]
        }"#;
        let cascade = HaarCascade::from_json(json).unwrap();
        assert_eq!((cascade.width, cascade.height), (8, 8));
        assert!(!cascade.features[0].tilted);
        assert_eq!(cascade.features[0].rects[1].rect, Rect::new(0, 0, 4, 8));
        assert_eq!(cascade.features[0].rects[1].weight, 2.0);
    }

    #[test]
    fn test_from_json_malformed() {
        assert!(matches!(
            HaarCascade::from_json("{ \"width\": 8 "),
            Err(CascadeError::Parse(_))
        ));
    }

    /// The edge cascade as `opencv_traincascade` would write it.
    const EDGE_CASCADE_XML: &str = r#"<?xml version="1.0"?>
<opencv_storage>
<cascade type_id="opencv-cascade-classifier"><stageType>BOOST</stageType>
  <featureType>HAAR</featureType>
  <height>8</height>
  <width>8</width>
  <stageParams>
    <maxWeakCount>1</maxWeakCount></stageParams>
  <featureParams>
    <maxCatCount>0</maxCatCount></featureParams>
  <stageNum>1</stageNum>
  <stages>
    <!-- stage 0 -->
    <_>
      <maxWeakCount>1</maxWeakCount>
      <stageThreshold>0.</stageThreshold>
      <weakClassifiers>
        <_>
          <internalNodes>
            0 -1 0 0.</internalNodes>
          <leafValues>
            -1. 1.</leafValues></_></weakClassifiers></_></stages>
  <features>
    <_>
      <rects>
        <_>
          0 0 8 8 -1.</_>
        <_>
          0 0 4 8 2.</_></rects></_></features></cascade>
</opencv_storage>
"#;

    #[test]
    fn test_from_xml() {
        let cascade = HaarCascade::from_xml(EDGE_CASCADE_XML).unwrap();
        let reference = edge_cascade();

        assert_eq!((cascade.width, cascade.height), (8, 8));
        assert_eq!(cascade.features.len(), 1);
        assert_eq!(cascade.features[0].rects, reference.features[0].rects);
        assert!(!cascade.features[0].tilted);

        let weak = &cascade.stages[0].classifiers[0];
        assert_eq!((weak.feature, weak.threshold, weak.left, weak.right), (0, 0.0, -1.0, 1.0));
        assert!((cascade.stages[0].threshold + XML_STAGE_THRESHOLD_EPS).abs() < 1e-9);

        let ii = IntegralImage::new(&split_image(8, 8, 4, 200, 50));
        assert!(cascade.evaluate(&ii, 0, 0));
    }

    #[test]
    fn test_parse_picks_format() {
        assert!(HaarCascade::parse(EDGE_CASCADE_XML).is_ok());
        assert!(matches!(HaarCascade::parse("<opencv_storage"), Err(CascadeError::Xml(_))));
        assert!(matches!(HaarCascade::parse("{"), Err(CascadeError::Parse(_))));
    }

    #[test]
    fn test_load_xml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("haarcascade_frontalface_default.xml");
        std::fs::write(&path, EDGE_CASCADE_XML).unwrap();
        let cascade = HaarCascade::load(&path).unwrap();
        assert_eq!(cascade.stages.len(), 1);
    }

    #[test]
    fn test_from_xml_rejects_other_cascade_kinds() {
        let lbp = EDGE_CASCADE_XML.replace("<featureType>HAAR", "<featureType>LBP");
        assert!(matches!(HaarCascade::from_xml(&lbp), Err(CascadeError::Unsupported(_))));

        let tree = EDGE_CASCADE_XML.replace("0 -1 0 0.</internalNodes>", "1 -1 0 0. 0 -2 0 0.</internalNodes>");
        assert!(matches!(HaarCascade::from_xml(&tree), Err(CascadeError::Unsupported(_))));

        let old_style = "<opencv_storage><haarcascade_frontalface type_id=\"opencv-haar-classifier\"/></opencv_storage>";
        assert!(matches!(HaarCascade::from_xml(old_style), Err(CascadeError::Unsupported(_))));
    }

    #[test]
    fn test_from_xml_tilted_feature_is_invalid() {
        let tilted = EDGE_CASCADE_XML.replace("</rects></_></features>", "</rects>\n      <tilted>1</tilted></_></features>");
        assert!(matches!(HaarCascade::from_xml(&tilted), Err(CascadeError::Invalid(_))));
    }

    #[test]
    fn test_from_xml_bad_number() {
        let broken = EDGE_CASCADE_XML.replace("<width>8</width>", "<width>eight</width>");
        assert!(matches!(HaarCascade::from_xml(&broken), Err(CascadeError::Invalid(_))));
    }

    #[test]
    fn test_pyramid_base_level_steps_two_pixels() {
        let cascade = edge_cascade();
        let gray = split_image(64, 64, 32, 220, 30);
        let base_only = DetectorParams { max_size: Some(8), ..params(0) };
        let hits = cascade.detect_multi_scale(&gray, &base_only);

        // Windows straddling the edge on the even grid: x in {26, 28, 30}, y in 0..=56.
        let mut xs: Vec<i32> = hits.iter().map(|r| r.x).collect();
        xs.sort_unstable();
        xs.dedup();
        assert_eq!(xs, vec![26, 28, 30]);
        assert!(hits.iter().all(|r| r.y % 2 == 0 && r.width == 8 && r.height == 8));
        assert_eq!(hits.len(), 3 * 29);
    }

    #[test]
    fn test_pyramid_upper_level_steps_one_pixel() {
        let cascade = edge_cascade();
        let gray = split_image(64, 64, 32, 220, 30);
        // Only the 2.25 level (18 px windows) passes both limits.
        let level = DetectorParams { max_size: Some(18), ..params(18) };
        let hits = cascade.detect_multi_scale(&gray, &level);
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|r| r.width == 18 && r.height == 18));

        let grid = |v: i32| (0..=20u32).find(|&k| (k as f64 * 2.25).round() as i32 == v);
        let mut ks: Vec<u32> = hits
            .iter()
            .map(|r| grid(r.x).unwrap_or_else(|| panic!("x {} is not round(k * 2.25)", r.x)))
            .collect();
        assert!(hits.iter().all(|r| grid(r.y).is_some()));
        ks.sort_unstable();
        ks.dedup();
        assert!(ks.windows(2).any(|w| w[1] == w[0] + 1), "scaled x positions {ks:?}");
    }

    #[test]
    fn test_validate_rejects_bad_feature_index() {
        let mut cascade = edge_cascade();
        cascade.stages[0].classifiers[0].feature = 3;
        assert!(matches!(cascade.validate(), Err(CascadeError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_rect_outside_window() {
        let mut cascade = edge_cascade();
        cascade.features[0].rects[1] = WeightedRect::from((6, 0, 4, 8, 2.0));
        assert!(matches!(cascade.validate(), Err(CascadeError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_tilted_and_empty() {
        let mut tilted = edge_cascade();
        tilted.features[0].tilted = true;
        assert!(tilted.validate().is_err());

        let mut empty = edge_cascade();
        empty.stages.clear();
        assert!(empty.validate().is_err());

        let mut hollow = edge_cascade();
        hollow.stages[0].classifiers.clear();
        assert!(hollow.validate().is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = HaarCascade::load(Path::new("/nonexistent/cascade.xml")).unwrap_err();
        assert!(matches!(err, CascadeError::NotFound(_)));
    }

    #[test]
    fn test_group_clusters_and_averages() {
        let mut rects: Vec<Rect> = (0..6).map(|i| Rect::new(100 + i, 50 + i, 40, 40)).collect();
        rects.push(Rect::new(300, 300, 40, 40));

        let groups = group_rectangles(&rects, 3, GROUP_EPS);
        assert_eq!(groups.len(), 1);
        let (rect, neighbors) = groups[0];
        assert_eq!(neighbors, 6);
        // means 102.5 and 52.5 round half to even
        assert_eq!(rect, Rect::new(102, 52, 40, 40));
    }

    #[test]
    fn test_group_is_transitive() {
        // a~b and b~c but a and c are too far apart on their own.
        let rects = [
            Rect::new(0, 0, 100, 100),
            Rect::new(15, 0, 100, 100),
            Rect::new(30, 0, 100, 100),
        ];
        assert!(!similar(&rects[0], &rects[2], GROUP_EPS));

        let groups = group_rectangles(&rects, 2, GROUP_EPS);
        assert_eq!(groups, vec![(Rect::new(15, 0, 100, 100), 3)]);
    }

    #[test]
    fn test_group_drops_nested_weaker_cluster() {
        let mut rects = vec![Rect::new(0, 0, 100, 100); 5];
        rects.extend(vec![Rect::new(20, 20, 30, 30); 4]);

        let groups = group_rectangles(&rects, 1, GROUP_EPS);
        assert_eq!(groups, vec![(Rect::new(0, 0, 100, 100), 5)]);
    }

    #[test]
    fn test_group_zero_neighbors_returns_raw() {
        let rects = [Rect::new(0, 0, 10, 10), Rect::new(1, 1, 10, 10)];
        let groups = group_rectangles(&rects, 0, GROUP_EPS);
        assert_eq!(groups, vec![(rects[0], 1), (rects[1], 1)]);
    }

    #[test]
    fn test_group_empty() {
        assert!(group_rectangles(&[], 3, GROUP_EPS).is_empty());
    }
}
