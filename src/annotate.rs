use opencv::{self as cv, prelude::*};

use crate::labels::LabelTable;
use crate::reco::Detection;

const BOX_COLOR: (f64, f64, f64) = (0., 255., 0.);
const TEXT_COLOR: (f64, f64, f64) = (0., 0., 0.);

/// Draws every detection's box and label onto `frame`.
pub fn annotate_objects(
    frame: &mut cv::core::Mat,
    detections: &[Detection],
    labels: &LabelTable,
) -> anyhow::Result<()> {
    let size = frame.size()?;
    for detection in detections {
        let position = detection.bbox.to_pixels(size);
        let name = labels.display_name(detection.class_id);
        if labels.name(detection.class_id).is_none() {
            log::warn!("class id {} has no label", detection.class_id);
        }

        log::info!(
            "id: {} ({})  score: {:.3}  bbox: [{}, {}, {}, {}]",
            detection.class_id,
            name,
            detection.score,
            position.x,
            position.y,
            position.x + position.width,
            position.y + position.height
        );

        cv::imgproc::rectangle_points(
            frame,
            position.tl(),
            cv::core::Point::new(position.x + position.width, position.y + position.height),
            scalar(BOX_COLOR),
            3,
            cv::imgproc::LINE_8,
            0,
        )?;
        put_text(
            frame,
            &label_text(&name, detection.score),
            cv::core::Point::new(position.x, position.y),
        )?;
    }
    Ok(())
}

pub fn label_text(name: &str, score: f32) -> String {
    format!("{} {:.2}", name, score)
}

pub fn draw_fps(frame: &mut cv::core::Mat, fps: f64) -> anyhow::Result<()> {
    put_text(frame, &format!("FPS: {:.1}", fps), cv::core::Point::new(5, 50))
}

fn put_text(frame: &mut cv::core::Mat, text: &str, origin: cv::core::Point) -> anyhow::Result<()> {
    cv::imgproc::put_text(
        frame,
        text,
        origin,
        cv::imgproc::FONT_HERSHEY_SIMPLEX,
        1.0,
        scalar(TEXT_COLOR),
        3,
        cv::imgproc::LINE_8,
        false,
    )?;
    Ok(())
}

fn scalar((b, g, r): (f64, f64, f64)) -> cv::core::Scalar {
    cv::core::Scalar::new(b, g, r, 0.)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reco::BoundingBox;

    fn blank(width: i32, height: i32) -> cv::core::Mat {
        cv::core::Mat::new_rows_cols_with_default(
            height,
            width,
            cv::core::CV_8UC3,
            cv::core::Scalar::all(255.),
        )
        .unwrap()
    }

    #[test]
    fn label_has_two_decimals() {
        assert_eq!(label_text("person", 0.8765), "person 0.88");
        assert_eq!(label_text("id 3", 0.5), "id 3 0.50");
    }

    #[test]
    fn box_is_drawn_at_pixel_corners() {
        let mut frame = blank(1280, 720);
        let detections = vec![Detection {
            bbox: BoundingBox {
                ymin: 0.1,
                xmin: 0.2,
                ymax: 0.5,
                xmax: 0.8,
            },
            class_id: 0,
            score: 0.9,
        }];
        let labels = LabelTable::parse("0: cat\n");
        annotate_objects(&mut frame, &detections, &labels).unwrap();

        // Outline is centred on x = 1024 and y = 360, three pixels wide.
        let green = [0, 255, 0];
        assert_eq!(frame.at_2d::<cv::core::Vec3b>(360, 1024).unwrap().0, green);
        assert_eq!(frame.at_2d::<cv::core::Vec3b>(216, 1025).unwrap().0, green);
        assert_eq!(frame.at_2d::<cv::core::Vec3b>(361, 640).unwrap().0, green);
        // Centre stays untouched.
        let px = frame.at_2d::<cv::core::Vec3b>(216, 640).unwrap();
        assert_eq!(px.0, [255, 255, 255]);
    }

    #[test]
    fn unknown_class_still_annotates() {
        let mut frame = blank(64, 64);
        let detections = vec![Detection {
            bbox: BoundingBox {
                ymin: 0.0,
                xmin: 0.0,
                ymax: 1.0,
                xmax: 1.0,
            },
            class_id: 99,
            score: 0.7,
        }];
        annotate_objects(&mut frame, &detections, &LabelTable::default()).unwrap();
    }
}
