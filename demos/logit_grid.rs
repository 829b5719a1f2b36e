use bayes_regression::{
    BackendRegistry, Dataset, DesignOptions, Density, Expr, McmcConfig, ModelBuilder, Predictor,
    Prior, RawColumns, render_prediction_table, render_summary_table, run, summarize,
};
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};

/// Logistic regression of a binary outcome with posterior-predictive draws
/// on an evenly spaced grid.
fn main() {
    let dataset = build_sample_dataset(250);
    let grid = dataset.grid_over("x", 15).expect("grid");
    let dataset = dataset.with_prediction_grid(grid.clone());

    let mut builder = ModelBuilder::for_dataset(&dataset);
    builder
        .add_vector_parameter("beta", 2, Prior::normal(0.0, 10.0))
        .expect("beta")
        .set_likelihood("spiral", Density::bernoulli_logit(Expr::linear_predictor("beta")))
        .expect("likelihood")
        .add_predictive_quantity(
            "spiral_new",
            Density::bernoulli_logit(Expr::linear_predictor("beta")),
        )
        .expect("spiral_new");
    let model = builder.build().expect("model");

    let fit = run(
        &BackendRegistry::with_defaults(),
        &model,
        &dataset,
        &McmcConfig::default(),
    )
    .expect("sampling succeeds");
    println!(
        "Coefficients\n\n{}",
        render_summary_table(&summarize(&fit.store, "beta", 0.95).expect("beta"), 0.95)
    );

    let predictions = Predictor::new(&fit.store, &model)
        .predict(&grid, None)
        .expect("stored predictions");
    let bands = predictions[0].bands(0.95).expect("bands");
    let points = grid.column("x").expect("grid x");
    println!(
        "\nProbability of a red spiral\n\n{}",
        render_prediction_table("x", &points, &bands, 0.95)
    );
}

fn build_sample_dataset(n: usize) -> Dataset {
    let mut rng = StdRng::seed_from_u64(11);
    let x: Vec<f64> = (0..n).map(|_| rng.random::<f64>().mul_add(8.0, -4.0)).collect();
    let spiral: Vec<f64> = x
        .iter()
        .map(|x| {
            let p = 1.0 / (1.0 + (-1.2f64).mul_add(*x, 0.8).exp());
            if rng.random::<f64>() < p { 1.0 } else { 0.0 }
        })
        .collect();
    let raw = RawColumns::new("spiral", spiral).with_predictor("x", x);
    Dataset::build(&raw, &DesignOptions::default()).expect("dataset")
}
