use std::sync::OnceLock;

use nalgebra::DVector;
use proptest::prelude::*;

use bdmmflow::configuration::LikelihoodConfiguration;
use bdmmflow::flow::flow::{
    Flow,
    FlowDirection
};
use bdmmflow::flow::flowcache::PrecomputedFlow;
use bdmmflow::math::curve::curve::PiecewiseCurve;
use bdmmflow::parameterization::canonicalparameterization::CanonicalParameterization;
use bdmmflow::parameterization::skylineparameter::{
    SkylineMatrix,
    SkylineVector,
    TimedParameter
};

fn parameterization(extra_change: bool) -> CanonicalParameterization {
    let death = if extra_change {
        SkylineVector::new(vec![1.0, 2.0], vec![vec![1.0, 0.7]; 3]).unwrap()
    } else {
        SkylineVector::new(vec![1.0], vec![vec![1.0, 0.7]; 2]).unwrap()
    };
    CanonicalParameterization::builder(3.0, 2)
        .birth_rate(SkylineVector::constant(vec![2.0, 1.5]))
        .death_rate(death)
        .sampling_rate(SkylineVector::constant(vec![0.5, 0.2]))
        .migration_rate(SkylineMatrix::broadcast(vec![1.0], vec![0.1, 0.3], 2).unwrap())
        .cross_birth_rate(SkylineMatrix::broadcast(vec![], vec![0.2], 2).unwrap())
        .rho_sampling(TimedParameter::new(vec![3.0], vec![vec![0.4, 0.4]]).unwrap())
        .build()
        .unwrap()
}

fn precompute(extra_change: bool, direction: FlowDirection) -> PrecomputedFlow {
    let config = LikelihoodConfiguration::default()
        .with_tolerances(1e-100, 1e-10)
        .with_flow_direction(direction);
    PrecomputedFlow::compute(&parameterization(extra_change), &config).unwrap()
}

fn backward_flow() -> &'static Flow {
    static FLOW: OnceLock<PrecomputedFlow> = OnceLock::new();
    &FLOW.get_or_init(|| precompute(false, FlowDirection::Backward)).flow
}

fn assert_close(a: &DVector<f64>, b: &DVector<f64>, tolerance: f64) {
    let scale = b.amax().max(1e-300);
    assert!((a - b).amax() / scale < tolerance, "{a} vs {b}");
}

#[test]
fn extinction_stays_in_the_unit_interval() {
    let precomputed = precompute(false, FlowDirection::Backward);
    for i in 0..=60 {
        let t = 0.05 * i as f64;
        let e = precomputed.extinction.value(t);
        assert!(e.iter().all(|x| (-1e-12..=1.0 + 1e-12).contains(x)), "e({t}) = {e}");
    }
}

#[test]
fn split_intervals_give_the_same_transition() {
    let unsplit = precompute(false, FlowDirection::Backward);
    let split = precompute(true, FlowDirection::Backward);
    let g = DVector::from_vec(vec![0.3, 0.8]);
    for (top, bottom) in [(0.0, 3.0), (0.5, 2.5), (1.5, 2.9)] {
        let a = unsplit.flow.solve_across(top, bottom, &g).unwrap();
        let b = split.flow.solve_across(top, bottom, &g).unwrap();
        assert_close(&b, &a, 1e-7);
    }
}

#[test]
fn forward_and_backward_references_agree() {
    let backward = precompute(false, FlowDirection::Backward);
    let forward = precompute(false, FlowDirection::Forward);
    let g = DVector::from_vec(vec![1.0, 0.25]);
    for (top, bottom) in [(0.0, 3.0), (0.7, 1.8), (1.0, 2.0)] {
        let a = backward.flow.solve_across(top, bottom, &g).unwrap();
        let b = forward.flow.solve_across(top, bottom, &g).unwrap();
        assert_close(&b, &a, 1e-7);
    }
}

#[test]
fn complete_interior_rho_cannot_be_crossed_forward() {
    let parameterization = CanonicalParameterization::builder(2.0, 1)
        .birth_rate(SkylineVector::constant(vec![1.0]))
        .death_rate(SkylineVector::constant(vec![0.5]))
        .rho_sampling(TimedParameter::new(vec![1.0], vec![vec![1.0]]).unwrap())
        .build()
        .unwrap();
    let config = LikelihoodConfiguration::default().with_flow_direction(FlowDirection::Forward);
    assert!(PrecomputedFlow::compute(&parameterization, &config).is_err());

    let backward = LikelihoodConfiguration::default();
    let flow = PrecomputedFlow::compute(&parameterization, &backward).unwrap().flow;
    assert!(flow.has_complete_rho());

    // 邊界以上仍可求解；穿過 rho = 1 的 lineage 必被取樣，故為 0
    let g = DVector::from_vec(vec![0.7]);
    let above = flow.solve_across(0.2, 0.9, &g).unwrap();
    assert!(above[0] > 0.0 && above[0].is_finite());
    let on_boundary = flow.solve_across(0.5, 1.0, &g).unwrap();
    assert!(on_boundary[0] > 0.0);
    let crossed = flow.solve_across(0.5, 1.5, &g).unwrap();
    assert_eq!(crossed[0], 0.0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// 跨 [t0, t2] 求解等於先跨 [t1, t2] 再跨 [t0, t1]
    #[test]
    fn solves_compose_over_subdivisions(
        times in prop::collection::vec(0.0f64..3.0, 3),
        g0 in 0.01f64..1.0,
        g1 in 0.01f64..1.0,
    ) {
        let mut times = times;
        times.sort_by(f64::total_cmp);
        let (t0, t1, t2) = (times[0], times[1], times[2]);
        let flow = backward_flow();
        let g = DVector::from_vec(vec![g0, g1]);

        let direct = flow.solve_across(t0, t2, &g).unwrap();
        let middle = flow.solve_across(t1, t2, &g).unwrap();
        let composed = flow.solve_across(t0, t1, &middle).unwrap();
        let scale = direct.amax().max(1e-300);
        prop_assert!((&composed - &direct).amax() / scale < 1e-8);
    }
}
