use bayes_regression::utils::sample_standard_normal;
use bayes_regression::{
    BackendRegistry, Dataset, DesignOptions, Density, Expr, McmcConfig, ModelBuilder, Predictor,
    Prior, RawColumns, convergence, render_convergence_table, render_jags,
    render_prediction_table, render_summary_table, run, summarize_all,
};
use rand::SeedableRng;
use rand::rngs::StdRng;

fn main() {
    let dataset = build_sample_dataset(300);

    let mut builder = ModelBuilder::for_dataset(&dataset);
    builder
        .add_vector_parameter("beta", 2, Prior::normal(0.0, 1.0e3))
        .expect("beta")
        .add_parameter("tau", Prior::gamma(1.0e-3, 1.0e-3))
        .expect("tau")
        .add_deterministic("epsilon", Expr::sym("tau").sqrt().recip())
        .expect("epsilon")
        .set_likelihood("y", Density::normal(Expr::linear_predictor("beta"), "epsilon"))
        .expect("likelihood")
        .add_generated_quantity("mu", Expr::linear_predictor("beta"))
        .expect("mu");
    let model = builder.build().expect("model");
    println!(
        "JAGS rendering\n\n{}",
        render_jags(&model).expect("model text")
    );

    let config = McmcConfig {
        chains: 3,
        iterations: 5_000,
        warmup: 2_000,
        ..McmcConfig::default()
    };
    let fit = run(&BackendRegistry::with_defaults(), &model, &dataset, &config)
        .expect("sampling succeeds");

    let summaries = summarize_all(&fit.store, 0.95).expect("summaries");
    println!("Posterior (mean, 95% credible interval)\n\n{}", render_summary_table(&summaries, 0.95));
    let diagnostics = convergence(&fit.store).expect("diagnostics");
    println!("\nConvergence\n\n{}", render_convergence_table(&diagnostics));

    let grid = dataset.grid_over("x", 11).expect("grid");
    let mu = Predictor::new(&fit.store, &model)
        .evaluate_quantity("mu", &grid, None)
        .expect("predictions");
    let bands = mu.bands(0.95).expect("bands");
    let points = grid.column("x").expect("grid x");
    println!(
        "\nRegression line\n\n{}",
        render_prediction_table("x", &points, &bands, 0.95)
    );
}

fn build_sample_dataset(n: usize) -> Dataset {
    let mut rng = StdRng::seed_from_u64(42);
    let x: Vec<f64> = (0..n).map(|i| idx_to_f64(i) / 30.0).collect();
    let y: Vec<f64> = x
        .iter()
        .map(|x| 0.4f64.mul_add(sample_standard_normal(&mut rng), 3.0f64.mul_add(*x, -1.0)))
        .collect();
    let raw = RawColumns::new("y", y).with_predictor("x", x);
    Dataset::build(&raw, &DesignOptions::default()).expect("dataset")
}

fn idx_to_f64(idx: usize) -> f64 {
    f64::from(u32::try_from(idx).unwrap_or(u32::MAX))
}
