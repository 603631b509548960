use foci_vision::core_modules::label_volume::{LabelVolume, activity_profile, unique_labels};
use foci_vision::core_modules::progress::NoProgress;
use foci_vision::core_modules::spot_filter::remove_isolated;
use foci_vision::{PipelineConfig, PipelineInputs, SpotPipeline};
use ndarray::{Array3, Array4, Axis};

const FRAMES: usize = 12;
const SIDE: usize = 40;

/// Nucleus 3 on the left, nucleus 8 on the right.
///
/// Nucleus 3 hosts a steady spot that, in frame 5, is joined by a far-away second blob
/// carrying the same ID. Nucleus 8 hosts a one-frame flicker at frame 9 and a stray
/// spot two pixels outside its edge in frames 2..6.
fn movie() -> PipelineInputs {
    let mut nuclei = LabelVolume::zeros((FRAMES, SIDE, SIDE));
    let mut spots = LabelVolume::zeros((FRAMES, SIDE, SIDE));
    let ints = Array3::<f64>::from_elem((FRAMES, SIDE, SIDE), 10.0);
    let vols = Array3::<f64>::from_elem((FRAMES, SIDE, SIDE), 2.0);
    let raw = Array4::<f64>::from_elem((FRAMES, 6, SIDE, SIDE), 4.0);

    for t in 0..FRAMES {
        for x in 2..38 {
            for y in 2..18 {
                nuclei[[t, x, y]] = 3;
            }
            for y in 22..38 {
                nuclei[[t, x, y]] = 8;
            }
        }
        for x in 10..13 {
            for y in 8..11 {
                spots[[t, x, y]] = 1;
            }
        }
    }
    // Second blob under nucleus 3, far from the first.
    spots[[5, 30, 9]] = 1;
    spots[[5, 31, 9]] = 1;
    // Flicker in nucleus 8.
    spots[[9, 20, 30]] = 1;
    // Stray spot in the gap between the nuclei, nearer nucleus 8.
    for t in 2..6 {
        spots[[t, 5, 20]] = 1;
    }

    PipelineInputs::new(nuclei, spots, raw, ints, vols)
}

#[tokio::test]
async fn full_run_honours_the_track_invariants() {
    let inputs = movie();
    let pipeline = SpotPipeline::new(PipelineConfig {
        max_workers: Some(3),
        ..PipelineConfig::default()
    })
    .expect("pipeline");
    let output = pipeline.run(&inputs).await.expect("run");

    // Every track label is a nucleus label of the same frame.
    for ((t, x, y), &label) in output.spot_track.indexed_iter() {
        if label != 0 {
            let frame = inputs.nuclei.index_axis(Axis(0), t);
            assert!(frame.iter().any(|&n| n == label), "label {label} at ({t}, {x}, {y})");
        }
    }

    // The stray spot joins nucleus 8, the flicker is removed.
    assert_eq!(output.spot_track[[3, 5, 20]], 8);
    assert_eq!(output.spot_track[[9, 20, 30]], 8);
    assert_eq!(output.filtered_track[[9, 20, 30]], 0);
    assert_eq!(output.filtered_track[[3, 5, 20]], 8);

    // The far blob of frame 5 is split off, the main spot stays.
    assert_eq!(output.one_spot_mask[[5, 30, 9]], 1);
    assert_eq!(output.one_spot_mask[[5, 11, 9]], 0);
    assert_eq!(output.filtered_track[[5, 11, 9]], 3);
    assert_eq!(output.filtered_track[[5, 30, 9]], 0);

    // Removed activity never comes back.
    for id in unique_labels(output.spot_track.view()) {
        let filtered = activity_profile(output.filtered_track.view(), id);
        let before = activity_profile(output.spot_track.view(), id);
        for (t, (&after, &was)) in filtered.iter().zip(&before).enumerate() {
            assert!(after <= was, "spot {id} reappeared at frame {t}");
        }
    }

    // Filtering again finds nothing new.
    let again = remove_isolated(
        output.filtered_track.view(),
        &pipeline.config().isolation_slots,
        &NoProgress,
    )
    .expect("isolated");
    assert!(again.iter().all(|&v| v == 0));

    assert_eq!(output.intensity.spot_ids, vec![3, 8]);
    assert_eq!(output.activity.active_counts[0], 1);
    assert_eq!(output.activity.active_counts[3], 2);
    assert_eq!(output.activity.composite_frames().len(), FRAMES);

    let table = output.bursts.to_array();
    assert_eq!(table.ncols(), 3 + 5 * output.bursts.width());
    assert_eq!(table[[0, 0]], 3.0);
    assert_eq!(table[[0, 1]], 1.0);
    assert_eq!(table[[0, 2]], FRAMES as f64);
    assert!(output.intensity.corrected.iter().all(|v| v.is_finite()));
}
