// THEORY:
// The dataset is a directory of pre-extracted frames:
//
//   <root>/<class>/<video>/<frame>.{png,jpg,jpeg}
//
// Class ids are the positions of the class directory names in sorted order, so the same
// tree always yields the same labels. A file list, when given, restricts and orders the
// videos. Each video resolves to its frame paths in file-name order, is resampled to a
// fixed length, and is decoded into a mean-centred `(frames, channels, height, width)` clip
// laid out the way the classifier was trained.

use crate::core_modules::classifier::{one_hot, DataSpec};
use crate::error::{AttackError, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::{Array1, Array4};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

const FRAME_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// One labelled video of the dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoSample {
    pub class_name: String,
    pub name: String,
    pub dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct VideoDataset {
    root: PathBuf,
    classes: Vec<String>,
    samples: Vec<VideoSample>,
}

impl VideoDataset {
    /// Scans `root`. With a `file_list`, only the listed videos are kept, in list order.
    pub fn open(root: &Path, file_list: Option<&Path>) -> Result<Self> {
        let classes = sorted_dirs(root)?;
        if classes.is_empty() {
            return Err(AttackError::Configuration(format!(
                "no class directories under {}",
                root.display()
            )));
        }

        let samples = match file_list {
            Some(list) => {
                let text = fs::read_to_string(list)?;
                parse_file_list(&text)?
                    .into_iter()
                    .map(|(class_name, name)| VideoSample {
                        dir: root.join(&class_name).join(&name),
                        class_name,
                        name,
                    })
                    .collect()
            }
            None => {
                let mut samples = Vec::new();
                for class_name in &classes {
                    for name in sorted_dirs(&root.join(class_name))? {
                        samples.push(VideoSample {
                            dir: root.join(class_name).join(&name),
                            class_name: class_name.clone(),
                            name,
                        });
                    }
                }
                samples
            }
        };

        tracing::info!(
            root = %root.display(),
            classes = classes.len(),
            videos = samples.len(),
            "opened dataset"
        );
        Ok(Self {
            root: root.to_path_buf(),
            classes,
            samples,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn samples(&self) -> &[VideoSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Keeps only the first `limit` videos.
    pub fn truncate(&mut self, limit: usize) {
        self.samples.truncate(limit);
    }

    pub fn class_index(&self, class_name: &str) -> Result<usize> {
        self.classes
            .iter()
            .position(|c| c == class_name)
            .ok_or_else(|| AttackError::Data(format!("unknown class '{class_name}'")))
    }

    /// Integer id and one-hot encoding of `class_name`.
    pub fn class_one_hot(&self, class_name: &str) -> Result<(usize, Array1<f32>)> {
        let id = self.class_index(class_name)?;
        Ok((id, one_hot(id, self.classes.len())))
    }

    /// Frame files of `sample`, sorted by file name.
    pub fn frames_for_sample(&self, sample: &VideoSample) -> Result<Vec<PathBuf>> {
        if !sample.dir.is_dir() {
            return Err(AttackError::Data(format!("missing video directory {}", sample.dir.display())));
        }
        let mut frames: Vec<PathBuf> = fs::read_dir(&sample.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_frame(path))
            .collect();
        frames.sort();
        Ok(frames)
    }
}

fn is_frame(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| FRAME_EXTENSIONS.iter().any(|known| known.eq_ignore_ascii_case(ext)))
}

fn sorted_dirs(dir: &Path) -> Result<Vec<String>> {
    let mut names: Vec<String> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().to_str().map(str::to_owned))
        .collect();
    names.sort();
    Ok(names)
}

/// Parses `class/video` or `class video` lines. Blank lines and `#` comments are ignored.
pub fn parse_file_list(text: &str) -> Result<Vec<(String, String)>> {
    let mut entries = Vec::new();
    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split(|c: char| c == '/' || c.is_whitespace()).filter(|p| !p.is_empty());
        match (parts.next(), parts.next()) {
            (Some(class_name), Some(video)) => entries.push((class_name.to_owned(), video.to_owned())),
            _ => {
                return Err(AttackError::Configuration(format!(
                    "file list line {} is not '<class>/<video>': {line}",
                    number + 1
                )))
            }
        }
    }
    Ok(entries)
}

/// Resamples `frames` to exactly `size` entries by taking every `len / size`-th one.
pub fn rescale_list<T: Clone>(frames: &[T], size: usize) -> Result<Vec<T>> {
    if size == 0 || frames.len() < size {
        return Err(AttackError::Data(format!(
            "video has {} frames, {size} are needed",
            frames.len()
        )));
    }
    let skip = frames.len() / size;
    Ok(frames.iter().step_by(skip).take(size).cloned().collect())
}

/// Decodes, resizes and mean-centres `frames` into a `(frames, channels, side, side)` clip.
pub fn load_clip(frames: &[PathBuf], spec: &DataSpec, crop: bool) -> Result<Array4<f32>> {
    if spec.channels != 3 || spec.mean.len() != 3 {
        return Err(AttackError::Configuration(format!(
            "frames decode to RGB but the model expects {} channels",
            spec.channels
        )));
    }
    let side = spec.crop_size as usize;
    let mut clip = Array4::zeros((frames.len(), 3, side, side));
    for (t, path) in frames.iter().enumerate() {
        let image = image::open(path)
            .map_err(|e| AttackError::Data(format!("cannot decode {}: {e}", path.display())))?
            .to_rgb8();
        let prepared = prepare_frame(&image, spec, crop);
        for (x, y, pixel) in prepared.enumerate_pixels() {
            for c in 0..3 {
                clip[[t, c, y as usize, x as usize]] = pixel[c] as f32 - spec.mean[c];
            }
        }
    }
    Ok(clip)
}

/// Resize then centre-crop to `crop_size`, or resize straight to it when `crop` is off.
fn prepare_frame(image: &RgbImage, spec: &DataSpec, crop: bool) -> RgbImage {
    let side = spec.crop_size;
    if !crop {
        return imageops::resize(image, side, side, FilterType::Triangle);
    }

    let (width, height) = image.dimensions();
    let shorter = width.min(height).max(1) as f32;
    let scale = spec.scale_size.max(side) as f32 / shorter;
    let scaled_w = ((width as f32 * scale).round() as u32).max(side);
    let scaled_h = ((height as f32 * scale).round() as u32).max(side);
    let scaled = imageops::resize(image, scaled_w, scaled_h, FilterType::Triangle);
    let x = (scaled_w - side) / 2;
    let y = (scaled_h - side) / 2;
    imageops::crop_imm(&scaled, x, y, side, side).to_image()
}

/// Reads a target file of `<video> <label>` lines.
pub fn load_targets(path: &Path) -> Result<HashMap<String, usize>> {
    let text = fs::read_to_string(path)?;
    parse_targets(&text)
}

pub fn parse_targets(text: &str) -> Result<HashMap<String, usize>> {
    let mut targets = HashMap::new();
    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        let label = match fields.as_slice() {
            [_, label] => label.parse::<usize>().ok(),
            _ => None,
        };
        match label {
            Some(label) => {
                targets.insert(fields[0].to_owned(), label);
            }
            None => {
                return Err(AttackError::Configuration(format!(
                    "target file line {} is not '<name> <label>': {line}",
                    number + 1
                )))
            }
        }
    }
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::classifier::ModelKind;
    use image::Rgb;

    fn write_frames(dir: &Path, count: usize, width: u32, height: u32) {
        fs::create_dir_all(dir).unwrap();
        for i in 0..count {
            let image = RgbImage::from_pixel(width, height, Rgb([200, 100, 50]));
            image.save(dir.join(format!("{i:04}.png"))).unwrap();
        }
    }

    #[test]
    fn rescale_takes_every_skip_th_frame() {
        let frames: Vec<usize> = (0..100).collect();
        let picked = rescale_list(&frames, 40).unwrap();
        assert_eq!(picked.len(), 40);
        assert_eq!(&picked[..3], &[0, 2, 4]);
        assert_eq!(picked[39], 78);

        let exact: Vec<usize> = (0..40).collect();
        assert_eq!(rescale_list(&exact, 40).unwrap(), exact);
    }

    #[test]
    fn short_video_is_a_data_error() {
        let frames: Vec<usize> = (0..39).collect();
        let err = rescale_list(&frames, 40).unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn file_list_accepts_both_separators() {
        let entries = parse_file_list("walk/v_01\n\n# skipped\nrun v_02\n").unwrap();
        assert_eq!(
            entries,
            vec![("walk".into(), "v_01".into()), ("run".into(), "v_02".into())]
        );
        assert!(parse_file_list("lonely\n").is_err());
    }

    #[test]
    fn targets_parse_and_reject_garbage() {
        let targets = parse_targets("v_01 3\nv_02\t7\n").unwrap();
        assert_eq!(targets["v_01"], 3);
        assert_eq!(targets["v_02"], 7);
        assert!(matches!(parse_targets("v_01 three"), Err(AttackError::Configuration(_))));
        assert!(parse_targets("v_01 1 2").is_err());
    }

    #[test]
    fn dataset_scans_sorted_classes_and_frames() {
        let root = tempfile::tempdir().unwrap();
        write_frames(&root.path().join("walk/v_b"), 3, 8, 6);
        write_frames(&root.path().join("run/v_a"), 2, 8, 6);
        fs::write(root.path().join("walk/v_b/notes.txt"), "x").unwrap();

        let dataset = VideoDataset::open(root.path(), None).unwrap();
        assert_eq!(dataset.classes(), &["run".to_string(), "walk".to_string()]);
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.samples()[1].name, "v_b");

        let (id, encoded) = dataset.class_one_hot("walk").unwrap();
        assert_eq!(id, 1);
        assert_eq!(encoded.to_vec(), vec![0.0, 1.0]);

        let frames = dataset.frames_for_sample(&dataset.samples()[1]).unwrap();
        assert_eq!(frames.len(), 3);
        assert!(frames[0].ends_with("0000.png"));
    }

    #[test]
    fn file_list_restricts_and_orders() {
        let root = tempfile::tempdir().unwrap();
        write_frames(&root.path().join("walk/v_b"), 1, 4, 4);
        write_frames(&root.path().join("run/v_a"), 1, 4, 4);
        let list = root.path().join("list.txt");
        fs::write(&list, "walk/v_b\n").unwrap();

        let dataset = VideoDataset::open(root.path(), Some(&list)).unwrap();
        assert_eq!(dataset.len(), 1);
        assert_eq!(dataset.samples()[0].class_name, "walk");
    }

    #[test]
    fn clip_is_cropped_and_mean_centred() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("walk/v");
        write_frames(&dir, 2, 40, 30);
        let frames: Vec<PathBuf> = (0..2).map(|i| dir.join(format!("{i:04}.png"))).collect();
        let spec = DataSpec {
            scale_size: 20,
            crop_size: 16,
            ..ModelKind::GoogleNet.data_spec()
        };

        for crop in [true, false] {
            let clip = load_clip(&frames, &spec, crop).unwrap();
            assert_eq!(clip.dim(), (2, 3, 16, 16));
            assert!((clip[[1, 0, 8, 8]] - (200.0 - 104.0)).abs() < 1.5);
            assert!((clip[[0, 2, 0, 0]] - (50.0 - 124.0)).abs() < 1.5);
        }
    }

    #[test]
    fn undecodable_frame_is_recoverable() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("0000.png");
        fs::write(&path, b"not a png").unwrap();
        let err = load_clip(&[path], &ModelKind::Inception2.data_spec(), true).unwrap_err();
        assert!(err.is_recoverable());
    }
}
