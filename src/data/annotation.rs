//! Class-name lists and line-delimited box annotations.
//!
//! `converted_coco`: one image per line, `<image_path> <class,x,y,w,h> ...`.
//! `yolo`: one image path per line, boxes in a sibling `.txt` file with
//! `<class> <x> <y> <w> <h>` rows. Coordinates are box centres and sizes
//! normalized to the image.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::{io_error, Result, TrainError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnnotationFormat {
    ConvertedCoco,
    Yolo,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxLabel {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    pub class_id: usize,
}

impl BoxLabel {
    pub fn xywh(&self) -> [f32; 4] {
        [self.x, self.y, self.w, self.h]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub image_path: PathBuf,
    pub boxes: Vec<BoxLabel>,
}

pub fn read_class_names(path: &Path) -> Result<Vec<String>> {
    if !path.is_file() {
        return Err(TrainError::MissingFile(path.to_path_buf()));
    }
    let content = fs::read_to_string(path).map_err(io_error(path))?;
    let names: Vec<_> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect();

    if names.is_empty() {
        return Err(TrainError::Config(format!(
            "class list {} is empty",
            path.display()
        )));
    }
    Ok(names)
}

/// Reads every annotation of `path`. Blank lines are skipped; any malformed
/// line, out-of-range class or missing image aborts the whole read.
pub fn read_annotations(
    path: &Path,
    format: AnnotationFormat,
    image_prefix: Option<&Path>,
    num_classes: usize,
) -> Result<Vec<Annotation>> {
    if !path.is_file() {
        return Err(TrainError::MissingFile(path.to_path_buf()));
    }
    let content = fs::read_to_string(path).map_err(io_error(path))?;

    let mut annotations = Vec::new();
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let malformed = |reason: String| TrainError::Annotation {
            path: path.to_path_buf(),
            line: index + 1,
            reason,
        };

        let mut annotation = match format {
            AnnotationFormat::ConvertedCoco => parse_converted_coco(line).map_err(malformed)?,
            AnnotationFormat::Yolo => {
                let image_path = PathBuf::from(line);
                let boxes = read_yolo_labels(&resolve(&image_path, image_prefix))?;
                Annotation { image_path, boxes }
            }
        };

        annotation.image_path = resolve(&annotation.image_path, image_prefix);
        if !annotation.image_path.is_file() {
            return Err(TrainError::MissingFile(annotation.image_path));
        }
        if let Some(label) = annotation.boxes.iter().find(|b| b.class_id >= num_classes) {
            return Err(TrainError::Annotation {
                path: path.to_path_buf(),
                line: index + 1,
                reason: format!("class id {} but only {num_classes} classes", label.class_id),
            });
        }

        annotations.push(annotation);
    }

    Ok(annotations)
}

fn resolve(image_path: &Path, prefix: Option<&Path>) -> PathBuf {
    match prefix {
        Some(prefix) if image_path.is_relative() => prefix.join(image_path),
        _ => image_path.to_path_buf(),
    }
}

fn parse_converted_coco(line: &str) -> std::result::Result<Annotation, String> {
    let mut tokens = line.split_whitespace();
    let image_path = tokens
        .next()
        .ok_or_else(|| "missing image path".to_string())?;

    let boxes = tokens
        .map(|token| {
            let fields: Vec<_> = token.split(',').collect();
            parse_box(&fields).map_err(|reason| format!("box `{token}`: {reason}"))
        })
        .collect::<std::result::Result<_, _>>()?;

    Ok(Annotation {
        image_path: PathBuf::from(image_path),
        boxes,
    })
}

fn read_yolo_labels(image_path: &Path) -> Result<Vec<BoxLabel>> {
    let label_path = image_path.with_extension("txt");
    if !label_path.is_file() {
        return Err(TrainError::MissingFile(label_path));
    }
    let content = fs::read_to_string(&label_path).map_err(io_error(&label_path))?;

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            let fields: Vec<_> = line.split_whitespace().collect();
            parse_box(&fields).map_err(|reason| TrainError::Annotation {
                path: label_path.clone(),
                line: index + 1,
                reason,
            })
        })
        .collect()
}

/// `[class, x, y, w, h]`
fn parse_box(fields: &[&str]) -> std::result::Result<BoxLabel, String> {
    let [class_id, x, y, w, h] = fields else {
        return Err(format!("expected 5 fields, got {}", fields.len()));
    };

    let class_id = class_id
        .parse::<f32>()
        .ok()
        .filter(|id| *id >= 0. && id.fract() == 0.)
        .ok_or_else(|| format!("invalid class id `{class_id}`"))? as usize;

    let mut values = [0f32; 4];
    for (value, field) in values.iter_mut().zip([x, y, w, h]) {
        *value = field
            .parse()
            .map_err(|_| format!("invalid coordinate `{field}`"))?;
    }
    let [x, y, w, h] = values;

    if !(w > 0. && h > 0.) {
        return Err(format!("non-positive size {w}x{h}"));
    }
    if !(0. ..=1.).contains(&x) || !(0. ..=1.).contains(&y) {
        return Err(format!("centre ({x}, {y}) outside the image"));
    }

    Ok(BoxLabel { x, y, w, h, class_id })
}
