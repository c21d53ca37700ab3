use ferrite_margin::{CenterLoss, IsolationLoss, Matrix, Sgd};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// `per_class` noisy points around each of `means`.
fn clusters(means: &[[f64; 2]], per_class: usize, spread: f64, rng: &mut StdRng) -> (Matrix, Vec<usize>) {
    let mut rows: Vec<Vec<f64>> = Vec::new();
    let mut labels = Vec::new();
    for (class, mean) in means.iter().enumerate() {
        for _ in 0..per_class {
            rows.push(mean.iter().map(|m| m + spread * rng.sample::<f64, _>(StandardNormal)).collect());
            labels.push(class);
        }
    }
    (Matrix::from_data(rows), labels)
}

fn main() -> ferrite_margin::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut rng = StdRng::seed_from_u64(2020);
    let optimizer = Sgd::new(0.5);

    // Center loss: centers drift to the cluster means.
    let means = [[2.0, 0.0], [-2.0, 1.0], [0.0, -3.0]];
    let (features, labels) = clusters(&means, 16, 0.3, &mut rng);
    let mut center_loss = CenterLoss::with_rng(means.len(), 2, &mut rng)?;

    for epoch in 0..50 {
        let grads = {
            let out = center_loss.forward(&features, &labels)?;
            if epoch % 10 == 0 {
                info!(epoch, loss = *out.value(), "center loss");
            }
            out.backward(&1.0)?
        };
        center_loss.apply_update(&optimizer, &grads.centers)?;
    }
    for (class, center) in center_loss.centers().data.iter().enumerate() {
        info!(class, ?center, mean = ?means[class], "learned center");
    }

    // Isolation loss: the center follows the real cluster and leaves the fakes outside r_fake.
    let (features, labels) = clusters(&[[1.0, 1.0], [4.0, -4.0]], 16, 0.02, &mut rng);
    let mut isolation = IsolationLoss::with_rng(2, 2, 0.042, 1.638, &mut rng)?;

    for epoch in 0..200 {
        let grads = {
            let out = isolation.forward(&features, &labels)?;
            if epoch % 40 == 0 {
                info!(epoch, loss = *out.value(), "isolation loss");
            }
            out.backward(&1.0)?
        };
        isolation.apply_update(&optimizer, &grads.center)?;
    }
    info!(center = ?isolation.center().row(0), "isolation center");

    Ok(())
}
