use crate::error::DataError;
use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use burn::tensor::TensorData;
use image::RgbImage;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Largest expected horizontal gaze magnitude, in degrees.
pub const MAX_HORIZONTAL_DEG: f32 = 15.0;
/// Largest expected vertical gaze magnitude, in degrees.
pub const MAX_VERTICAL_DEG: f32 = 10.0;

/// Which eye the patch was cropped from. Right-eye patches were flipped
/// horizontally when the corpus was produced, so their horizontal angle sign
/// is mirrored back to the left-eye frame during parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EyeSide {
    Left,
    Right,
}

/// One corpus image, parsed once from its filename.
///
/// Angles are stored normalized: horizontal divided by 15, vertical by 10,
/// which places both in [-1, 1].
#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub identity: u32,
    pub head_pose: String,
    pub horizontal: f32,
    pub vertical: f32,
    pub side: EyeSide,
    pub path: PathBuf,
}

/// Grouping key: all orientation variants for one identity, head pose and
/// eye side end up in the same group.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct GroupKey {
    pub identity: u32,
    pub head_pose: String,
    pub side: EyeSide,
}

/// Parse a corpus filename of the form `ID_2m_{pose}P_{v}V_{h}H_{side}.jpg`.
pub fn parse_filename(dir: &Path, file_name: &str) -> Result<ImageRecord, DataError> {
    let parse_err = || DataError::Parse {
        file: file_name.to_string(),
    };

    let stem = file_name
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(file_name);
    let fields: Vec<&str> = stem.split('_').collect();
    if fields.len() != 6 {
        return Err(parse_err());
    }

    let identity: u32 = fields[0].parse().map_err(|_| parse_err())?;
    if identity == 0 {
        return Err(parse_err());
    }
    let head_pose = fields[2].to_string();
    let vertical: f32 = fields[3]
        .strip_suffix('V')
        .ok_or_else(parse_err)?
        .parse()
        .map_err(|_| parse_err())?;
    let horizontal: f32 = fields[4]
        .strip_suffix('H')
        .ok_or_else(parse_err)?
        .parse()
        .map_err(|_| parse_err())?;
    let side = match fields[5] {
        "L" => EyeSide::Left,
        "R" => EyeSide::Right,
        _ => return Err(parse_err()),
    };
    let flip = match side {
        EyeSide::Left => 1.0,
        EyeSide::Right => -1.0,
    };

    Ok(ImageRecord {
        identity,
        head_pose,
        horizontal: flip * horizontal / MAX_HORIZONTAL_DEG,
        vertical: vertical / MAX_VERTICAL_DEG,
        side,
        path: dir.join(file_name),
    })
}

/// Index over a dataset directory, grouped by (identity, head pose, side).
///
/// Groups with fewer than two members cannot form pairs and are dropped at
/// construction, so they never show up in downstream counts.
#[derive(Debug, Clone)]
pub struct AngleIndexer {
    groups: BTreeMap<GroupKey, Vec<ImageRecord>>,
}

impl AngleIndexer {
    /// Scan `dir` for `.jpg` files and build the group index.
    ///
    /// Filenames that do not match the naming convention are skipped with a
    /// warning; an unreadable directory is fatal.
    pub fn scan(dir: &Path) -> Result<Self, DataError> {
        let entries = std::fs::read_dir(dir).map_err(|source| DataError::Scan {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| DataError::Scan {
                path: dir.to_path_buf(),
                source,
            })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".jpg") {
                names.push(name);
            }
        }
        names.sort();

        let mut groups: BTreeMap<GroupKey, Vec<ImageRecord>> = BTreeMap::new();
        for name in &names {
            match parse_filename(dir, name) {
                Ok(record) => {
                    let key = GroupKey {
                        identity: record.identity,
                        head_pose: record.head_pose.clone(),
                        side: record.side,
                    };
                    groups.entry(key).or_default().push(record);
                }
                Err(err) => tracing::warn!("skipping {name}: {err}"),
            }
        }
        groups.retain(|_, records| records.len() >= 2);

        Ok(Self { groups })
    }

    pub fn groups(&self) -> &BTreeMap<GroupKey, Vec<ImageRecord>> {
        &self.groups
    }
}

/// A (source, target) pairing within one group. Source and target always
/// share identity, head pose and eye side; only the gaze angle differs.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingPair {
    pub source: PathBuf,
    /// Normalized (horizontal, vertical) source angle.
    pub source_angle: [f32; 2],
    /// Zero-indexed identity label.
    pub label: i64,
    pub target: PathBuf,
    /// Normalized (horizontal, vertical) target angle.
    pub target_angle: [f32; 2],
}

/// Expand each group into its full cross-product of (source, target) pairs,
/// self-pairs included, and split by identity.
///
/// Identities at or below `train_id_threshold` contribute every pair to the
/// training split. Identities above it contribute only the LAST pair
/// enumerated for the group (source outer, target inner) to the test split,
/// keeping the held-out set at one pair per group. The last-pair choice
/// reproduces the reference pipeline exactly so test-set content stays
/// comparable across experiments.
pub fn build_pairs(
    indexer: &AngleIndexer,
    train_id_threshold: u32,
) -> (Vec<TrainingPair>, Vec<TrainingPair>) {
    let mut train = Vec::new();
    let mut test = Vec::new();

    for (key, records) in indexer.groups() {
        let mut last = None;
        for source in records {
            for target in records {
                let pair = TrainingPair {
                    source: source.path.clone(),
                    source_angle: [source.horizontal, source.vertical],
                    label: i64::from(key.identity) - 1,
                    target: target.path.clone(),
                    target_angle: [target.horizontal, target.vertical],
                };
                if key.identity <= train_id_threshold {
                    train.push(pair);
                } else {
                    last = Some(pair);
                }
            }
        }
        if let Some(pair) = last {
            test.push(pair);
        }
    }

    (train, test)
}

/// Decodes an image file into channel-first floats in [0, 1].
///
/// Injected into the batcher so path bookkeeping stays separate from pixel
/// decoding, and tests can substitute synthetic pixels.
pub trait ImageLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<Vec<f32>, DataError>;
}

/// Filesystem loader: decode, resize to the training resolution, CHW floats.
pub struct FsLoader {
    image_size: u32,
}

impl FsLoader {
    pub fn new(image_size: u32) -> Self {
        Self { image_size }
    }
}

impl ImageLoader for FsLoader {
    fn load(&self, path: &Path) -> Result<Vec<f32>, DataError> {
        let bytes = std::fs::read(path).map_err(|source| DataError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut img = image::load_from_memory(&bytes)
            .map_err(|source| DataError::Decode {
                path: path.to_path_buf(),
                source,
            })?
            .to_rgb8();
        if img.width() != self.image_size || img.height() != self.image_size {
            img = image::imageops::resize(
                &img,
                self.image_size,
                self.image_size,
                image::imageops::FilterType::CatmullRom,
            );
        }
        Ok(image_to_chw(&img))
    }
}

/// Convert RGB image data to CHW floats in [0, 1].
fn image_to_chw(img: &RgbImage) -> Vec<f32> {
    let (width, height) = img.dimensions();
    let hw = (width * height) as usize;
    let mut out = vec![0.0f32; hw * 3];

    for y in 0..height {
        for x in 0..width {
            let pixel = img.get_pixel(x, y).0;
            let idx = (y * width + x) as usize;
            out[idx] = pixel[0] as f32 / 255.0;
            out[hw + idx] = pixel[1] as f32 / 255.0;
            out[2 * hw + idx] = pixel[2] as f32 / 255.0;
        }
    }

    out
}

/// Indexable view over a pair list. Decoding is deferred to the batcher, so
/// construction never touches pixel data.
#[derive(Debug, Clone)]
pub struct PairDataset {
    pairs: Vec<TrainingPair>,
}

impl PairDataset {
    pub fn new(pairs: Vec<TrainingPair>) -> Self {
        Self { pairs }
    }
}

impl Dataset<TrainingPair> for PairDataset {
    fn get(&self, index: usize) -> Option<TrainingPair> {
        self.pairs.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.pairs.len()
    }
}

/// One decoded batch: source/target images with their normalized angles and
/// identity labels, all on the same device.
#[derive(Clone, Debug)]
pub struct GazeBatch<B: Backend> {
    pub sources: Tensor<B, 4>,
    pub source_angles: Tensor<B, 2>,
    pub labels: Tensor<B, 1, Int>,
    pub targets: Tensor<B, 4>,
    pub target_angles: Tensor<B, 2>,
}

/// Batcher decoding pairs on demand through the injected loader.
#[derive(Clone)]
pub struct PairBatcher {
    loader: Arc<dyn ImageLoader>,
    image_size: usize,
}

impl PairBatcher {
    pub fn new(loader: Arc<dyn ImageLoader>, image_size: usize) -> Self {
        Self { loader, image_size }
    }
}

impl<B: Backend> Batcher<B, TrainingPair, GazeBatch<B>> for PairBatcher {
    fn batch(&self, items: Vec<TrainingPair>, device: &B::Device) -> GazeBatch<B> {
        let batch_size = items.len();
        let size = self.image_size;
        let mut sources = Vec::with_capacity(batch_size * 3 * size * size);
        let mut targets = Vec::with_capacity(batch_size * 3 * size * size);
        let mut source_angles = Vec::with_capacity(batch_size);
        let mut target_angles = Vec::with_capacity(batch_size);
        let mut labels = Vec::with_capacity(batch_size);

        for pair in &items {
            // Decode failures are fatal: an unreadable image aborts the run.
            let mut source = self
                .loader
                .load(&pair.source)
                .expect("failed to decode source image");
            let mut target = self
                .loader
                .load(&pair.target)
                .expect("failed to decode target image");
            sources.append(&mut source);
            targets.append(&mut target);
            source_angles.push(pair.source_angle);
            target_angles.push(pair.target_angle);
            labels.push(pair.label);
        }

        GazeBatch {
            sources: Tensor::from_data(
                TensorData::new(sources, [batch_size, 3, size, size]),
                device,
            ),
            source_angles: angle_tensor(&source_angles, device),
            labels: Tensor::from_data(TensorData::new(labels, [batch_size]), device),
            targets: Tensor::from_data(
                TensorData::new(targets, [batch_size, 3, size, size]),
                device,
            ),
            target_angles: angle_tensor(&target_angles, device),
        }
    }
}

/// Build an [n, 2] angle tensor from (horizontal, vertical) rows.
pub fn angle_tensor<B: Backend>(angles: &[[f32; 2]], device: &B::Device) -> Tensor<B, 2> {
    let flat: Vec<f32> = angles.iter().flatten().copied().collect();
    Tensor::from_data(TensorData::new(flat, [angles.len(), 2]), device)
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestBackend = burn::backend::NdArray<f32>;

    fn record(name: &str) -> ImageRecord {
        parse_filename(Path::new("/data"), name).expect("valid filename")
    }

    #[test]
    fn parses_left_eye_filename() {
        let rec = record("7_2m_0P_-10V_15H_L.jpg");
        assert_eq!(rec.identity, 7);
        assert_eq!(rec.head_pose, "0P");
        assert_eq!(rec.side, EyeSide::Left);
        assert_eq!(rec.horizontal, 1.0);
        assert_eq!(rec.vertical, -1.0);
        assert_eq!(rec.path, PathBuf::from("/data/7_2m_0P_-10V_15H_L.jpg"));
    }

    #[test]
    fn right_eye_flips_horizontal_only() {
        let left = record("3_2m_0P_10V_15H_L.jpg");
        let right = record("3_2m_0P_10V_15H_R.jpg");
        assert_eq!(right.horizontal, -left.horizontal);
        assert_eq!(right.vertical, left.vertical);
    }

    #[test]
    fn angles_are_normalized_into_unit_range() {
        for name in [
            "1_2m_0P_-10V_-15H_L.jpg",
            "1_2m_0P_10V_15H_R.jpg",
            "1_2m_0P_0V_5H_L.jpg",
        ] {
            let rec = record(name);
            assert!((-1.0..=1.0).contains(&rec.horizontal));
            assert!((-1.0..=1.0).contains(&rec.vertical));
        }
    }

    #[test]
    fn rejects_malformed_filenames() {
        for name in [
            "notes.jpg",
            "7_2m_0P_10V_15H.jpg",
            "7_2m_0P_10V_15H_X.jpg",
            "0_2m_0P_10V_15H_L.jpg",
            "7_2m_0P_10Z_15H_L.jpg",
        ] {
            assert!(parse_filename(Path::new("/data"), name).is_err(), "{name}");
        }
    }

    #[test]
    fn scan_groups_and_skips_bad_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let names = [
            "1_2m_0P_0V_0H_L.jpg",
            "1_2m_0P_0V_5H_L.jpg",
            "1_2m_0P_0V_10H_L.jpg",
            "1_2m_0P_0V_0H_R.jpg",
            "2_2m_0P_0V_0H_L.jpg",
            "garbage.jpg",
            "readme.txt",
        ];
        for name in names {
            std::fs::write(dir.path().join(name), b"").expect("write fixture");
        }

        let indexer = AngleIndexer::scan(dir.path()).expect("scan");
        // The single-member groups (1/R and 2/L) and the malformed file are
        // all excluded; only identity 1 left-eye survives.
        assert_eq!(indexer.groups().len(), 1);
        let (key, records) = indexer.groups().iter().next().expect("one group");
        assert_eq!(key.identity, 1);
        assert_eq!(key.side, EyeSide::Left);
        assert_eq!(records.len(), 3);
    }

    fn synthetic_indexer() -> AngleIndexer {
        let mut groups: BTreeMap<GroupKey, Vec<ImageRecord>> = BTreeMap::new();
        for (identity, count) in [(1u32, 3usize), (60u32, 2usize)] {
            let records: Vec<ImageRecord> = (0..count)
                .map(|i| record(&format!("{identity}_2m_0P_0V_{}H_L.jpg", i as i32 * 5)))
                .collect();
            groups.insert(
                GroupKey {
                    identity,
                    head_pose: "0P".to_string(),
                    side: EyeSide::Left,
                },
                records,
            );
        }
        AngleIndexer { groups }
    }

    #[test]
    fn cross_product_counts_are_squared_group_sizes() {
        let indexer = synthetic_indexer();
        let (train, test) = build_pairs(&indexer, 50);
        // Identity 1 has 3 members -> 9 train pairs; identity 60 has 2
        // members -> exactly one test pair.
        assert_eq!(train.len(), 9);
        assert_eq!(test.len(), 1);
    }

    #[test]
    fn split_is_a_strict_partition_by_identity() {
        let indexer = synthetic_indexer();
        let (train, test) = build_pairs(&indexer, 50);
        assert!(train.iter().all(|p| p.label < 50));
        assert!(test.iter().all(|p| p.label >= 50));
    }

    #[test]
    fn labels_are_zero_indexed() {
        let indexer = synthetic_indexer();
        let (train, test) = build_pairs(&indexer, 50);
        assert!(train.iter().all(|p| p.label == 0));
        assert!(test.iter().all(|p| p.label == 59));
    }

    #[test]
    fn test_split_keeps_last_enumerated_pair() {
        let indexer = synthetic_indexer();
        let (_, test) = build_pairs(&indexer, 50);
        // Source outer, target inner: the last pair enumerated is the
        // self-pair of the group's final record.
        let records = indexer
            .groups()
            .values()
            .last()
            .expect("held-out group")
            .clone();
        let last = records.last().expect("non-empty group");
        assert_eq!(test[0].source, last.path);
        assert_eq!(test[0].target, last.path);
        assert_eq!(test[0].source_angle, test[0].target_angle);
    }

    #[test]
    fn self_pairs_are_included() {
        let indexer = synthetic_indexer();
        let (train, _) = build_pairs(&indexer, 50);
        let self_pairs = train.iter().filter(|p| p.source == p.target).count();
        assert_eq!(self_pairs, 3);
    }

    struct SyntheticLoader {
        image_size: usize,
    }

    impl ImageLoader for SyntheticLoader {
        fn load(&self, _path: &Path) -> Result<Vec<f32>, DataError> {
            Ok(vec![0.5; 3 * self.image_size * self.image_size])
        }
    }

    #[test]
    fn batcher_produces_expected_shapes() {
        let indexer = synthetic_indexer();
        let (train, _) = build_pairs(&indexer, 50);
        let batcher = PairBatcher::new(Arc::new(SyntheticLoader { image_size: 8 }), 8);
        let device = Default::default();
        let batch: GazeBatch<TestBackend> =
            Batcher::<TestBackend, _, _>::batch(&batcher, train[..4].to_vec(), &device);

        assert_eq!(batch.sources.dims(), [4, 3, 8, 8]);
        assert_eq!(batch.targets.dims(), [4, 3, 8, 8]);
        assert_eq!(batch.source_angles.dims(), [4, 2]);
        assert_eq!(batch.target_angles.dims(), [4, 2]);
        assert_eq!(batch.labels.dims(), [4]);
    }
}
