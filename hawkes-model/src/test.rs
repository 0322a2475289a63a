//! Integration tests for the hawkes-model crate.

use crate::gibbs::McmcChain;
use crate::meanfield::MeanField;
use crate::model::{
    ModelParameters, NetworkHawkesGibbs, NetworkHawkesMeanField, NetworkHawkesOptions,
};
use crate::standard::{StandardHawkesModel, StandardHawkesOptions};
use ndarray::prelude::*;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn planted_options() -> NetworkHawkesOptions {
    let mut opts = NetworkHawkesOptions::new(2);
    opts.b = 2;
    opts.dt_max = 4.0;
    opts.fixed_p = Some(0.5);
    opts.fixed_v = Some(5.0);
    opts
}

/// A generator with one strong planted edge 0 -> 1 and a quiet reverse
/// direction, plus the counts it produced.
fn planted_edge_data(t: usize, seed: u64) -> (ModelParameters, Array2<u64>) {
    let mut opts = planted_options();
    opts.seed = seed;
    let mut gen = NetworkHawkesGibbs::new(&opts).unwrap();

    let mut params = gen.parameters();
    params.lambda0 = array![3.0, 0.5];
    params.a = array![[0.0, 1.0], [0.0, 0.0]];
    params.w = array![[0.1, 0.8], [0.1, 0.1]];
    let mut g = Array3::zeros((2, 2, 2));
    g.slice_mut(s![.., .., 0]).fill(0.75);
    g.slice_mut(s![.., .., 1]).fill(0.25);
    params.g = g;
    gen.set_parameters(&params).unwrap();
    assert!(gen.check_stability());

    let sim = gen.generate(t, false).unwrap();
    assert!(!sim.saturated);
    (params, sim.counts)
}

#[test]
fn gibbs_recovers_the_planted_edge() {
    init_logger();
    let (truth, counts) = planted_edge_data(400, 1);

    let mut model = NetworkHawkesGibbs::new(&planted_options()).unwrap();
    model.add_data(&counts).unwrap();
    let chain = McmcChain::run(&mut model, 100, None).unwrap();

    let mean_a = chain.posterior_mean_adjacency().unwrap();
    assert!(mean_a[[0, 1]] > 0.9, "planted edge {}", mean_a[[0, 1]]);
    assert!(mean_a[[1, 0]] < 0.3, "reverse edge {}", mean_a[[1, 0]]);

    let mean_w = chain.posterior_mean_weights().unwrap();
    assert!(
        (mean_w[[0, 1]] - 0.8).abs() < 0.4,
        "planted weight {}",
        mean_w[[0, 1]]
    );

    let mean_bias = chain.posterior_mean_bias().unwrap();
    assert!(
        (mean_bias[[0]] - truth.lambda0[0]).abs() < 1.0,
        "background rate {}",
        mean_bias[[0]]
    );
}

#[test]
fn gibbs_log_probability_climbs_from_a_poor_start() {
    init_logger();
    let (_, counts) = planted_edge_data(300, 2);

    let mut model = NetworkHawkesGibbs::new(&planted_options()).unwrap();
    model.add_data(&counts).unwrap();
    model.initialize_to_background_rate().unwrap();

    let chain = McmcChain::run(&mut model, 60, None).unwrap();
    let early: f64 = chain.log_probs[..5].iter().sum::<f64>() / 5.0;
    let late: f64 = chain.log_probs[chain.len() - 5..].iter().sum::<f64>() / 5.0;
    assert!(late > early, "early {} late {}", early, late);
}

#[test]
fn meanfield_recovers_the_planted_edge() {
    init_logger();
    let (_, counts) = planted_edge_data(400, 3);

    let mut model = NetworkHawkesMeanField::new(&planted_options()).unwrap();
    model.add_data(&counts).unwrap();
    for _ in 0..30 {
        model.meanfield_coordinate_descent_step().unwrap();
    }

    let rho = model.weights.expected_a();
    assert!(rho[[0, 1]] > 0.9, "planted edge {}", rho[[0, 1]]);
    assert!(rho[[1, 0]] < 0.3, "reverse edge {}", rho[[1, 0]]);

    let e_w = model.weights.expected_w();
    assert!(
        (e_w[[0, 1]] - 0.8).abs() < 0.4,
        "planted weight {}",
        e_w[[0, 1]]
    );
}

#[test]
fn heldout_likelihood_favors_the_fitted_model() {
    init_logger();
    let (_, train) = planted_edge_data(400, 4);
    let (_, test) = planted_edge_data(200, 5);

    let mut model = NetworkHawkesGibbs::new(&planted_options()).unwrap();
    model.add_data(&train).unwrap();
    let before = model.heldout_log_likelihood(&test).unwrap();
    McmcChain::run(&mut model, 50, None).unwrap();
    let after = model.heldout_log_likelihood(&test).unwrap();
    assert!(after > before, "before {} after {}", before, after);
}

#[test]
fn standard_model_seeds_the_network_model() {
    init_logger();
    let (_, counts) = planted_edge_data(300, 6);

    let mut opts = StandardHawkesOptions::new(2);
    opts.b = 2;
    opts.dt_max = 4.0;
    opts.l2_penalty = 1e-3;
    let mut standard = StandardHawkesModel::new(&opts).unwrap();
    standard.add_data(&counts, None).unwrap();
    standard.initialize_to_background_rate().unwrap();
    standard.fit_with_bfgs(200).unwrap();

    let mut model = NetworkHawkesGibbs::new(&planted_options()).unwrap();
    model.add_data(&counts).unwrap();
    model.initialize_with_standard_model(&standard).unwrap();

    let ll = model.log_likelihood().unwrap();
    assert!(ll.is_finite());

    // the MAP fit should beat the all-background explanation
    let mut background = NetworkHawkesGibbs::new(&planted_options()).unwrap();
    background.add_data(&counts).unwrap();
    background.initialize_to_background_rate().unwrap();
    let mut params = background.parameters();
    params.a = Array2::zeros((2, 2));
    background.set_parameters(&params).unwrap();
    assert!(ll > background.log_likelihood().unwrap());
}

#[test]
fn serialized_parameters_roundtrip_through_json() {
    init_logger();
    let model = NetworkHawkesGibbs::new(&planted_options()).unwrap();
    let params = model.parameters();
    let json = serde_json::to_string(&params).unwrap();
    let back: ModelParameters = serde_json::from_str(&json).unwrap();
    assert_eq!(params.w, back.w);
    assert_eq!(params.g, back.g);
    assert_eq!(params.c, back.c);
}

#[test]
fn mf_point_samples_give_finite_heldout_likelihoods() {
    init_logger();
    let (_, train) = planted_edge_data(300, 7);
    let (_, test) = planted_edge_data(100, 8);

    let mut model = NetworkHawkesMeanField::new(&planted_options()).unwrap();
    model.add_data(&train).unwrap();
    for _ in 0..10 {
        model.meanfield_coordinate_descent_step().unwrap();
    }
    for _ in 0..5 {
        model.resample_from_mf().unwrap();
        assert!(model.heldout_log_likelihood(&test).unwrap().is_finite());
    }
}
