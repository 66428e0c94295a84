//! How often people leave their home area: a binomial regression of the
//! share of surveyed people who took a trip, with coefficient draws.

use nalgebra::DVector;
use rand::Rng;

use crate::design::{DesignBuilder, DesignMatrix};
use crate::glm::{FitError, FittedGlm, Link, fit_binomial, predict_with_coefficients};
use crate::mvn::MultivariateNormal;
use crate::parameters::Parameters;
use crate::survey::SurveyTable;

pub const MODEL: &str = "frequency";

pub fn design(table: &SurveyTable) -> DesignMatrix {
    let ad2: Vec<&str> = table.areas.iter().map(|a| a.ad2.as_str()).collect();
    DesignBuilder::new(table.len())
        .numeric("population", table.areas.iter().map(|a| a.population).collect())
        .factor("ad2", &ad2, &table.ad2_levels())
        .numeric(
            "distance_to_capital",
            table.areas.iter().map(|a| a.distance_to_capital()).collect(),
        )
        .build()
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeavingRate {
    pub probability: f64,
    /// Probability of leaving on any one day of the survey period.
    pub daily_rate: f64,
}

pub fn leaving_rate(probability: f64, survey_days: f64) -> LeavingRate {
    LeavingRate {
        probability,
        daily_rate: probability / survey_days,
    }
}

pub struct FrequencyOutput {
    pub fit: FittedGlm,
    /// Leaving rates from the fitted coefficients, one per survey row.
    pub rates: Vec<LeavingRate>,
    pub mean: DVector<f64>,
    /// Probabilities per draw, in draw order.
    pub draws: Vec<DVector<f64>>,
}

pub fn run<R: Rng + ?Sized>(
    table: &SurveyTable,
    parameters: &Parameters,
    rng: &mut R,
) -> Result<FrequencyOutput, FitError> {
    let design = design(table);
    let successes: Vec<f64> = table.areas.iter().map(|a| a.trip_counts as f64).collect();
    let trials: Vec<f64> = table.areas.iter().map(|a| a.n as f64).collect();
    let fit = fit_binomial(&design, &successes, &trials, MODEL)?;
    fit.log_summary();

    let mean = fit.predict(&design.matrix, None);
    let rates = mean
        .iter()
        .map(|p| leaving_rate(*p, parameters.survey_days))
        .collect();

    let mvn = MultivariateNormal::new(fit.coefficients.clone(), &fit.covariance)?;
    let draws = mvn
        .sample_n(parameters.n_draws, rng)
        .iter()
        .map(|coefficients| predict_with_coefficients(&design.matrix, Link::Logit, coefficients, None))
        .collect();
    log::info!("{MODEL}: {} draws", parameters.n_draws);

    Ok(FrequencyOutput {
        fit,
        rates,
        mean,
        draws,
    })
}

#[cfg(test)]
mod test {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::survey::fixtures::synthetic_table;

    #[test]
    fn test_probabilities_and_rates() {
        let table = synthetic_table(7);
        let parameters = Parameters {
            n_draws: 20,
            ..Parameters::default()
        };
        let output = run(&table, &parameters, &mut StdRng::seed_from_u64(1)).unwrap();

        assert_eq!(output.mean.len(), table.len());
        assert_eq!(output.draws.len(), 20);
        for rate in &output.rates {
            assert!((0.0..=1.0).contains(&rate.probability));
            assert_eq!(rate.daily_rate, rate.probability / 56.0);
        }
        for draw in &output.draws {
            assert_eq!(draw.len(), table.len());
            assert!(draw.iter().all(|p| (0.0..=1.0).contains(p)));
        }
        assert_eq!(output.fit.names[0], "(Intercept)");
        assert_eq!(output.fit.names.last().unwrap(), "distance_to_capital");
    }

    #[test]
    fn test_mean_is_reproducible() {
        let table = synthetic_table(7);
        let parameters = Parameters {
            n_draws: 5,
            ..Parameters::default()
        };
        let a = run(&table, &parameters, &mut StdRng::seed_from_u64(1)).unwrap();
        let b = run(&table, &parameters, &mut StdRng::seed_from_u64(99)).unwrap();
        assert_eq!(a.mean, b.mean);
        assert_ne!(a.draws, b.draws);

        let c = run(&table, &parameters, &mut StdRng::seed_from_u64(1)).unwrap();
        assert_eq!(a.draws, c.draws);
    }

    #[test]
    fn test_single_area_scenario() {
        // 40 of 100 surveyed left home. With only an intercept the fitted
        // probability is the observed share, every time.
        let design = DesignBuilder::new(1).build();
        let first = fit_binomial(&design, &[40.0], &[100.0], MODEL).unwrap();
        let second = fit_binomial(&design, &[40.0], &[100.0], MODEL).unwrap();
        assert_eq!(first.coefficients, second.coefficients);

        let p = predict_with_coefficients(&design.matrix, Link::Logit, &first.coefficients, None);
        assert!(f64::abs(p[0] - 0.4) < 1e-8);
        assert_eq!(leaving_rate(p[0], 56.0).daily_rate, p[0] / 56.0);
    }
}
