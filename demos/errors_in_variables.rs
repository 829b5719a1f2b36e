use bayes_regression::utils::sample_standard_normal;
use bayes_regression::{
    BackendRegistry, Dataset, DesignOptions, Density, Expr, McmcConfig, ModelBuilder, Prior,
    RawColumns, render_summary_table, run, summarize, summarize_all,
};
use rand::SeedableRng;
use rand::rngs::StdRng;

/// Errors in both coordinates: the true predictor and the true response are
/// latent, each observed with a known per-point measurement error.
fn main() {
    let dataset = build_sample_dataset(60);

    let mut builder = ModelBuilder::for_dataset(&dataset);
    builder
        .add_parameter("alpha", Prior::normal(0.0, 1.0e3))
        .expect("alpha")
        .add_parameter("beta", Prior::normal(0.0, 1.0e3))
        .expect("beta")
        .add_parameter("scatter", Prior::uniform(0.0, 10.0))
        .expect("scatter")
        .add_latent("xtrue", Density::normal(0.0, 100.0), "x")
        .expect("xtrue")
        .add_latent(
            "ytrue",
            Density::normal(Expr::sym("alpha") + Expr::sym("beta") * "xtrue", "scatter"),
            "y",
        )
        .expect("ytrue");
    let model = builder.build().expect("model");

    let config = McmcConfig {
        chains: 3,
        iterations: 6_000,
        warmup: 2_000,
        thin: 2,
        ..McmcConfig::default()
    };
    let fit = run(&BackendRegistry::with_defaults(), &model, &dataset, &config)
        .expect("sampling succeeds");
    println!(
        "Posterior (mean, 95% credible interval)\n\n{}",
        render_summary_table(&summarize_all(&fit.store, 0.95).expect("summaries"), 0.95)
    );

    let xtrue = summarize(&fit.store, "xtrue", 0.95).expect("latent summary");
    let observed = dataset.column("x").expect("x");
    println!("\nFirst five latent predictors (observed -> posterior mean)");
    for (summary, x) in xtrue.iter().zip(&observed).take(5) {
        println!("  {:>8}: {x:>7.3} -> {:>7.3}", summary.label, summary.mean);
    }
}

fn build_sample_dataset(n: usize) -> Dataset {
    let mut rng = StdRng::seed_from_u64(7);
    let x_true: Vec<f64> = (0..n)
        .map(|_| 2.0f64.mul_add(sample_standard_normal(&mut rng), 5.0))
        .collect();
    let x_err: Vec<f64> = (0..n).map(|i| 0.2 + 0.1 * idx_to_f64(i % 3)).collect();
    let y_err = vec![0.3; n];
    let x: Vec<f64> = x_true
        .iter()
        .zip(&x_err)
        .map(|(x, err)| err.mul_add(sample_standard_normal(&mut rng), *x))
        .collect();
    let y: Vec<f64> = x_true
        .iter()
        .map(|x| 0.5f64.mul_add(sample_standard_normal(&mut rng), 1.5f64.mul_add(*x, 2.0)))
        .collect();
    let raw = RawColumns::new("y", y)
        .with_predictor("x", x)
        .with_measurement_error("x", x_err)
        .with_measurement_error("y", y_err);
    Dataset::build(&raw, &DesignOptions::default()).expect("dataset")
}

fn idx_to_f64(idx: usize) -> f64 {
    f64::from(u32::try_from(idx).unwrap_or(u32::MAX))
}
