use anyhow::{Result, anyhow};
use tch::Tensor;

/// Conversion of an environment state into network input.
pub trait ToTensor {
    fn to_features(&self) -> Vec<f32>;

    /// Single state as a `(1, state_dim)` batch.
    fn to_tensor(&self) -> Tensor {
        Tensor::from_slice(&self.to_features()).unsqueeze(0)
    }
}

impl<const N: usize> ToTensor for [f32; N] {
    fn to_features(&self) -> Vec<f32> {
        self.to_vec()
    }
}

impl ToTensor for Vec<f32> {
    fn to_features(&self) -> Vec<f32> {
        self.clone()
    }
}

/// Draws the per-episode reward curve to a PNG file.
pub fn plot_rewards(rewards: &[f32], filename: &str, title: &str) -> Result<()> {
    use plotters::prelude::*;

    let draw_err = |e: &dyn std::fmt::Display| anyhow!("failed to plot {filename}: {e}");

    let root = BitMapBackend::new(filename, (800, 600)).into_drawing_area();
    root.fill(&WHITE).map_err(|e| draw_err(&e))?;

    let min_reward = rewards.iter().cloned().fold(0.0f32, f32::min);
    let max_reward = rewards.iter().cloned().fold(f32::MIN, f32::max).max(1.0); // 避免空图或全为 0

    let mut chart = ChartBuilder::on(&root)
        .caption(title, ("sans-serif", 32).into_font())
        .margin(30)
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d(0..rewards.len().max(1), min_reward..max_reward)
        .map_err(|e| draw_err(&e))?;

    chart
        .configure_mesh()
        .x_desc("Episode")
        .y_desc("Total Reward")
        .light_line_style(&WHITE.mix(0.3))
        .draw()
        .map_err(|e| draw_err(&e))?;

    chart
        .draw_series(LineSeries::new(
            rewards.iter().enumerate().map(|(i, r)| (i, *r)),
            &BLUE,
        ))
        .map_err(|e| draw_err(&e))?
        .label("Reward")
        .legend(|(x, y)| PathElement::new([(x, y), (x + 20, y)], &BLUE));

    chart
        .configure_series_labels()
        .background_style(&WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()
        .map_err(|e| draw_err(&e))?;

    root.present().map_err(|e| draw_err(&e))?;
    log::info!("saved training plot to {filename}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_become_single_row_batches() {
        let t = [0.1f32, 0.2, 0.3, 0.4].to_tensor();
        assert_eq!(t.size(), vec![1, 4]);
        assert_eq!(vec![1.0f32, 2.0].to_features(), vec![1.0, 2.0]);
    }
}
