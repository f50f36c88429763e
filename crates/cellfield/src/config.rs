//! Defines all the CLI arguments.

use cellfield::ComputeType;

/// `Config`
#[derive(clap::Parser, Debug)]
pub struct Config {
    /// Width and height of the field in cells. Powers of two keep every reduction pass exact.
    #[arg(
        long,
        value_name = "Cells per side",
        default_value_t = 128,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub size: u32,
    /// How many times the controller ticks before the snapshot is taken.
    #[arg(long, value_name = "Number of ticks", default_value_t = 200)]
    pub ticks: u32,
    /// Simulation steps per tick.
    #[arg(long, value_name = "Steps per tick", default_value_t = 1)]
    pub steps_per_tick: u32,
    /// Steps between read-backs of the field's mean energy. Every read-back stalls until the GPU
    /// has caught up, so this trades responsiveness of the feedback for speed.
    #[arg(
        long,
        value_name = "Steps between reductions",
        default_value_t = 4,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub reduce_every: u32,
    /// Where to run the kernels.
    #[arg(
        long,
        value_enum,
        value_name = "The method of running the kernel",
        default_value_t = ComputeType::Gpu
    )]
    pub compute: ComputeType,
    /// Seed for the initial blobs of energy. The same seed always grows the same field.
    #[arg(long, value_name = "Random seed", default_value_t = 0)]
    pub seed: u64,
    /// How many blobs of energy to start with.
    #[arg(long, value_name = "Number of blobs", default_value_t = 12)]
    pub blobs: u32,
    /// Neighbourhood radius in cells.
    #[arg(long, value_name = "Radius in cells", default_value_t = 8)]
    pub radius: u32,
    /// The neighbourhood energy at which growth peaks.
    #[arg(long, value_name = "Growth centre", default_value_t = 0.15)]
    pub mu: f32,
    /// How far from `mu` the neighbourhood energy can stray and still grow.
    #[arg(long, value_name = "Growth width", default_value_t = 0.017)]
    pub sigma: f32,
    /// Time step.
    #[arg(long, value_name = "Time step", default_value_t = 0.1)]
    pub dt: f32,
    /// Fraction of matter lost every step.
    #[arg(long, value_name = "Matter decay", default_value_t = 0.01)]
    pub decay: f32,
    /// The mean energy the feedback steers towards.
    #[arg(long, value_name = "Target mean energy", default_value_t = 0.12)]
    pub target_mean: f32,
    /// How strongly the mean energy feeds back into growth.
    #[arg(long, value_name = "Feedback strength", default_value_t = 0.5)]
    pub feedback: f32,
    /// Rebuild the field from scratch at the start of this tick, at the size given by `--resize-to`.
    #[arg(long, value_name = "Tick to resize at", requires = "resize_to")]
    pub resize_at: Option<u32>,
    /// The width and height to rebuild the field at.
    #[arg(
        long,
        value_name = "Cells per side",
        requires = "resize_at",
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub resize_to: Option<u32>,
    /// Directory to save the final snapshot of the field's energy to.
    #[arg(long, value_name = "Directory to save output to", default_value = "./")]
    pub output_dir: std::path::PathBuf,
}

impl Config {
    /// The field rule described by the arguments.
    pub const fn rule(&self) -> cellfield_kernel::field::Rule {
        cellfield_kernel::field::Rule {
            radius: self.radius,
            mu: self.mu,
            sigma: self.sigma,
            dt: self.dt,
            decay: self.decay,
            target_mean: self.target_mean,
            feedback: self.feedback,
        }
    }

    /// What the controller needs to know.
    pub const fn settings(&self) -> crate::controller::Settings {
        crate::controller::Settings {
            size: self.size,
            steps_per_tick: self.steps_per_tick,
            reduce_every: self.reduce_every,
            seed: self.seed,
            blobs: self.blobs,
            rule: self.rule(),
        }
    }
}

#[cfg(test)]
mod test {
    use clap::Parser as _;

    use super::*;

    #[test]
    fn defaults_match_the_reference_rule() {
        let config = Config::parse_from(["cellfield"]);
        assert_eq!(config.rule(), cellfield_kernel::field::Rule::default());
        assert_eq!(config.compute, ComputeType::Gpu);
        assert_eq!(config.settings().reduce_every, 4);
    }

    #[test]
    fn reductions_need_a_positive_interval() {
        assert!(Config::try_parse_from(["cellfield", "--reduce-every", "0"]).is_err());
        let config =
            Config::try_parse_from(["cellfield", "--compute", "cpu", "--size", "16"]).unwrap();
        assert_eq!(config.compute, ComputeType::Cpu);
        assert_eq!(config.size, 16);
    }

    #[test]
    fn resizing_needs_both_a_tick_and_a_size() {
        assert!(Config::try_parse_from(["cellfield", "--resize-at", "10"]).is_err());
        let config =
            Config::try_parse_from(["cellfield", "--resize-at", "10", "--resize-to", "64"])
                .unwrap();
        assert_eq!((config.resize_at, config.resize_to), (Some(10), Some(64)));
    }
}
