use std::cell::RefCell;

use anyhow::{bail, Context};
use opencv::{self as cv, prelude::*};

/// Normalized box in [0,1], in the model's (ymin, xmin, ymax, xmax) order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub ymin: f32,
    pub xmin: f32,
    pub ymax: f32,
    pub xmax: f32,
}

impl BoundingBox {
    /// Scales the box to pixel coordinates of a frame of `size`.
    pub fn to_pixels(&self, size: cv::core::Size) -> cv::core::Rect {
        let width = size.width as f32;
        let height = size.height as f32;
        let left = (self.xmin * width) as i32;
        let top = (self.ymin * height) as i32;
        let right = (self.xmax * width) as i32;
        let bottom = (self.ymax * height) as i32;
        cv::core::Rect::new(left, top, right - left, bottom - top)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub class_id: usize,
    pub score: f32,
}

pub trait Detector {
    /// Frame size the model expects; frames must be resized to it first.
    fn input_size(&self) -> cv::core::Size;

    fn detect_objects(
        &self,
        frame: &cv::core::Mat,
        threshold: f32,
    ) -> anyhow::Result<Vec<Detection>>;
}

/// SSD-style detector whose graph ends in the TFLite detection
/// post-process op. OpenCV imports that op as a single DetectionOutput
/// blob; the raw boxes, classes, scores, count outputs are read as well.
pub struct SsdDetector {
    net: RefCell<cv::dnn::Net>,
    input_size: cv::core::Size,
    class_offset: i32,
}

impl SsdDetector {
    /// `class_offset` is subtracted from DetectionOutput labels, for builds
    /// that count the background class as label 0.
    pub fn new(
        model_file: &str,
        input_size: cv::core::Size,
        class_offset: i32,
    ) -> anyhow::Result<Self> {
        let net = cv::dnn::read_net(model_file, "", "")
            .with_context(|| format!("failed to load model {}", model_file))?;
        if net.empty()? {
            bail!("model {} loaded with no layers", model_file);
        }
        log::info!(
            "loaded model {} (input {}x{})",
            model_file,
            input_size.width,
            input_size.height
        );
        Ok(SsdDetector {
            net: RefCell::new(net),
            input_size,
            class_offset,
        })
    }
}

impl Detector for SsdDetector {
    fn input_size(&self) -> cv::core::Size {
        self.input_size
    }

    fn detect_objects(
        &self,
        frame: &cv::core::Mat,
        threshold: f32,
    ) -> anyhow::Result<Vec<Detection>> {
        let size = frame.size()?;
        if size != self.input_size {
            bail!(
                "frame is {}x{}, model expects {}x{}",
                size.width,
                size.height,
                self.input_size.width,
                self.input_size.height
            );
        }

        let mut blob = cv::dnn::blob_from_image(
            frame,
            1.0,
            self.input_size,
            cv::core::Scalar::default(),
            true,
            false,
            cv::core::CV_32F,
        )?;

        let mut net = self.net.borrow_mut();
        net.set_input(&mut blob, "", 1.0, cv::core::Scalar::default())?;

        let mut forward_output = cv::types::VectorOfMat::new();
        let out_blob_names = net.get_unconnected_out_layers_names()?;
        net.forward(&mut forward_output, &out_blob_names)?;

        match forward_output.len() {
            // TFLite_Detection_PostProcess imported as a DetectionOutput layer
            1 => {
                let output = forward_output.get(0)?;
                let (boxes, classes, scores) =
                    split_detection_output(output.data_typed::<f32>()?, self.class_offset);
                Ok(filter_detections(
                    &boxes,
                    &classes,
                    &scores,
                    scores.len(),
                    threshold,
                ))
            }
            n if n >= 4 => {
                let boxes = forward_output.get(0)?;
                let classes = forward_output.get(1)?;
                let scores = forward_output.get(2)?;
                let count = forward_output.get(3)?;

                let count = count.data_typed::<f32>()?.first().copied().unwrap_or(0.0);

                Ok(filter_detections(
                    boxes.data_typed::<f32>()?,
                    classes.data_typed::<f32>()?,
                    scores.data_typed::<f32>()?,
                    count.max(0.0) as usize,
                    threshold,
                ))
            }
            n => bail!(
                "model produced {} outputs, expected a detection blob or boxes, classes, scores and count",
                n
            ),
        }
    }
}

/// Splits a `[1,1,N,7]` DetectionOutput blob, rows of
/// `(image_id, label, conf, xmin, ymin, xmax, ymax)`, into boxes in
/// (ymin, xmin, ymax, xmax) order, class ids and scores.
///
/// Rows with a negative image id are padding and end the list.
/// `class_offset` is subtracted from each label.
pub fn split_detection_output(
    data: &[f32],
    class_offset: i32,
) -> (Vec<f32>, Vec<f32>, Vec<f32>) {
    let mut boxes = Vec::new();
    let mut classes = Vec::new();
    let mut scores = Vec::new();
    for row in data.chunks_exact(7) {
        if row[0] < 0.0 {
            break;
        }
        boxes.extend_from_slice(&[row[4], row[3], row[6], row[5]]);
        classes.push(row[1] - class_offset as f32);
        scores.push(row[2]);
    }
    (boxes, classes, scores)
}

/// Keeps the first `count` entries whose score reaches `threshold`,
/// in output order.
pub fn filter_detections(
    boxes: &[f32],
    classes: &[f32],
    scores: &[f32],
    count: usize,
    threshold: f32,
) -> Vec<Detection> {
    let count = count
        .min(scores.len())
        .min(classes.len())
        .min(boxes.len() / 4);

    let mut output = Vec::new();
    for i in 0..count {
        if scores[i] < threshold {
            continue;
        }
        let b = &boxes[4 * i..4 * i + 4];
        output.push(Detection {
            bbox: BoundingBox {
                ymin: b[0],
                xmin: b[1],
                ymax: b[2],
                xmax: b[3],
            },
            class_id: classes[i].max(0.0) as usize,
            score: scores[i],
        });
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxes(n: usize) -> Vec<f32> {
        (0..n)
            .flat_map(|i| {
                let v = i as f32 / 10.0;
                [v, v, v + 0.1, v + 0.1]
            })
            .collect()
    }

    #[test]
    fn threshold_keeps_order() {
        let found = filter_detections(&boxes(3), &[1.0, 2.0, 3.0], &[0.9, 0.4, 0.6], 3, 0.5);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].class_id, 1);
        assert_eq!(found[0].score, 0.9);
        assert_eq!(found[1].class_id, 3);
        assert_eq!(found[1].score, 0.6);
        assert_eq!(found[1].bbox.ymin, 0.2);
    }

    #[test]
    fn score_equal_to_threshold_is_kept() {
        let found = filter_detections(&boxes(1), &[0.0], &[0.55], 1, 0.55);
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn count_limits_entries() {
        let found = filter_detections(&boxes(3), &[0.0, 0.0, 0.0], &[0.9, 0.9, 0.9], 2, 0.5);
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn count_is_clamped_to_tensor_length() {
        let found = filter_detections(&boxes(2), &[0.0, 0.0], &[0.9, 0.9], 10, 0.5);
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn detection_output_rows_are_reordered() {
        #[rustfmt::skip]
        let blob = [
            0.0, 17.0, 0.9, 0.2, 0.1, 0.8, 0.5,
            0.0, 3.0, 0.4, 0.0, 0.0, 0.5, 0.5,
            0.0, 1.0, 0.6, 0.3, 0.4, 0.6, 0.7,
        ];
        let (boxes, classes, scores) = split_detection_output(&blob, 0);
        assert_eq!(&boxes[..4], &[0.1, 0.2, 0.5, 0.8]);
        assert_eq!(classes, vec![17.0, 3.0, 1.0]);

        let found = filter_detections(&boxes, &classes, &scores, scores.len(), 0.5);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].class_id, 17);
        assert_eq!(
            found[0].bbox,
            BoundingBox {
                ymin: 0.1,
                xmin: 0.2,
                ymax: 0.5,
                xmax: 0.8,
            }
        );
        assert_eq!(found[1].class_id, 1);
        assert_eq!(found[1].score, 0.6);
    }

    #[test]
    fn detection_output_padding_ends_rows() {
        #[rustfmt::skip]
        let blob = [
            0.0, 2.0, 0.9, 0.0, 0.0, 1.0, 1.0,
            -1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
            0.0, 4.0, 0.9, 0.0, 0.0, 1.0, 1.0,
        ];
        let (_, classes, scores) = split_detection_output(&blob, 1);
        assert_eq!(classes, vec![1.0]);
        assert_eq!(scores.len(), 1);
    }

    #[test]
    fn box_maps_to_display_pixels() {
        let bbox = BoundingBox {
            ymin: 0.1,
            xmin: 0.2,
            ymax: 0.5,
            xmax: 0.8,
        };
        let rect = bbox.to_pixels(cv::core::Size::new(1280, 720));
        assert_eq!((rect.x, rect.y), (256, 72));
        assert_eq!((rect.x + rect.width, rect.y + rect.height), (1024, 360));
    }
}
