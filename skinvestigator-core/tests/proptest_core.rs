//! Property tests for the numeric and scheduling invariants.

use candle_core::{Device, Tensor};
use proptest::prelude::*;
use rand::SeedableRng;
use rand::rngs::StdRng;
use skinvestigator_core::config::ImageSize;
use skinvestigator_core::model::io::encode_model;
use skinvestigator_core::model::quantize::{dequantize_tensor, quantize_tensor};
use skinvestigator_core::model::{LayerConfig, Model, ModelSpec, quantize_model};
use skinvestigator_core::training::ReduceLrOnPlateau;
use skinvestigator_core::training::callbacks::{EarlyStopping, StopDecision};
use skinvestigator_core::tuner::{SearchSpace, bracket_schedule};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn quantization_error_is_within_half_a_step(
        values in prop::collection::vec(-10.0f32..10.0, 1..256)
    ) {
        let n = values.len();
        let t = Tensor::from_vec(values.clone(), n, &Device::Cpu).unwrap();
        let q = quantize_tensor(&t).unwrap();
        let back = dequantize_tensor(&q.values, q.scale)
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        for (orig, approx) in values.iter().zip(back) {
            prop_assert!((orig - approx).abs() <= q.scale * 0.5 + 1e-5);
        }
    }

    #[test]
    fn plateau_lr_never_rises_or_undershoots(
        losses in prop::collection::vec(0.0f64..5.0, 1..80),
        patience in 1usize..6,
        cooldown in 0usize..4,
        factor in 0.1f64..0.9,
    ) {
        let min_lr = 1e-6;
        let mut plateau = ReduceLrOnPlateau::new(factor, patience, min_lr, 1e-3, cooldown);
        let mut lr = 1e-3;
        for loss in losses {
            if let Some(next) = plateau.observe(loss, lr) {
                prop_assert!(next < lr);
                prop_assert!(next >= min_lr);
                lr = next;
            }
        }
    }

    #[test]
    fn early_stopping_waits_out_patience(
        losses in prop::collection::vec(0.0f64..5.0, 1..80),
        patience in 1usize..8,
    ) {
        let mut stopper = EarlyStopping::new(patience, 0.0);
        for (epoch, loss) in losses.iter().enumerate() {
            if stopper.observe(epoch, *loss) == StopDecision::Stop {
                let best = stopper.best_epoch().unwrap();
                prop_assert!(epoch > 0);
                prop_assert_eq!(epoch, best + patience);
                break;
            }
        }
    }

    #[test]
    fn sampled_configurations_stay_in_space(seed in any::<u64>()) {
        let space = SearchSpace::default();
        let mut rng = StdRng::seed_from_u64(seed);
        for _ in 0..8 {
            let hp = space.sample(&mut rng);
            prop_assert!(space.contains(&hp), "{hp} escaped the space");
        }
    }

    #[test]
    fn schedule_rounds_shrink_and_lengthen(max_epochs in 1usize..200, factor in 2usize..6) {
        let schedule = bracket_schedule(max_epochs, factor);
        prop_assert!(!schedule.is_empty());
        for bracket in &schedule {
            prop_assert_eq!(bracket.rounds.len(), bracket.index + 1);
            prop_assert_eq!(bracket.rounds.last().unwrap().epochs, max_epochs);
            for pair in bracket.rounds.windows(2) {
                prop_assert!(pair[0].trials >= pair[1].trials);
                prop_assert!(pair[0].epochs <= pair[1].epochs);
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn quantized_artifact_is_never_larger(filters in 4usize..12, units in 16usize..48) {
        let size = ImageSize::new(8, 8);
        let mut spec = ModelSpec::fixed(size);
        spec.layers = vec![
            LayerConfig::conv(filters),
            LayerConfig::pool(),
            LayerConfig::Flatten,
            LayerConfig::dense(units),
        ];
        let model = Model::new(spec, &Device::Cpu).unwrap();
        let primary = encode_model(&model).unwrap();
        let (quantized, result) = quantize_model(&model).unwrap();
        prop_assert!(result.quantized_tensors >= 1);
        prop_assert!(quantized.len() <= primary.len());
    }
}
