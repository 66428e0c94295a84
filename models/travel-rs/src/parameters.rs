use rand::{SeedableRng, rngs::StdRng};
use serde::Deserialize;

use crate::survey::Destination;

/// Model inputs from the `input` section of the run description. Every
/// field has a default so an empty section runs all three pipelines.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Parameters {
    pub n_draws: usize,
    /// Candidate coefficient draws tried by the negative-binomial model.
    pub nb_candidates: usize,
    /// Near/far split for the gravity model, in distance units.
    pub distance_cutoff: f64,
    /// Length of the survey recall period, in days.
    pub survey_days: f64,
    pub off_island_population: f64,
    pub degenerate_check: DegenerateCheck,
    pub reference_destination: Destination,
    pub pipelines: Vec<Pipeline>,
    #[serde(skip)]
    pub seed: u64,
    #[serde(skip)]
    pub replicate: u64,
}

impl Default for Parameters {
    fn default() -> Self {
        Parameters {
            n_draws: 100,
            nb_candidates: 250,
            distance_cutoff: 20_000.0,
            survey_days: 56.0,
            off_island_population: 1_200_000.0,
            degenerate_check: DegenerateCheck::default(),
            reference_destination: Destination::OffIsland,
            pipelines: vec![
                Pipeline::Frequency,
                Pipeline::Multinomial,
                Pipeline::NegativeBinomial,
            ],
            seed: 0,
            replicate: 0,
        }
    }
}

impl Parameters {
    /// Independent generator per pipeline, so enabling or disabling one
    /// pipeline does not shift another's draws.
    pub fn rng(&self, pipeline: Pipeline) -> StdRng {
        let seed = self
            .seed
            .wrapping_add(self.replicate.wrapping_mul(1000))
            .wrapping_add(pipeline.stream());
        StdRng::seed_from_u64(seed)
    }
}

/// Region and year whose off-island weight must stay nonzero in a
/// negative-binomial draw.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DegenerateCheck {
    pub ad2: String,
    pub year: i32,
}

impl Default for DegenerateCheck {
    fn default() -> Self {
        DegenerateCheck {
            ad2: "moka".to_string(),
            year: 2018,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pipeline {
    Frequency,
    Multinomial,
    NegativeBinomial,
}

impl Pipeline {
    fn stream(&self) -> u64 {
        match self {
            Pipeline::Frequency => 0,
            Pipeline::Multinomial => 1,
            Pipeline::NegativeBinomial => 2,
        }
    }
}
