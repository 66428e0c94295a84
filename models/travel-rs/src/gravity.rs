//! Gravity model of trip volume between origins and destinations.
//!
//! Trip counts are fitted with two negative-binomial regressions, one for
//! pairs closer than the distance cutoff and one for the rest. Predictions
//! are rescaled from the surveyed sample to the full origin population and
//! normalized per origin into destination weights.

use nalgebra::{DMatrix, DVector};
use rand::Rng;

use crate::design::{DesignBuilder, DesignMatrix, factor_levels};
use crate::error::TravelError;
use crate::glm::{FittedGlm, Link, predict_with_coefficients};
use crate::mvn::MultivariateNormal;
use crate::nbinom::fit_negative_binomial;
use crate::output::{DestinationDraw, DrawLabel};
use crate::parameters::{DegenerateCheck, Parameters};
use crate::survey::{DESTINATION_COUNT, Destination, LongRow, SurveyTable};

pub const MODEL: &str = "negative_binomial";
pub const MODEL_NEAR: &str = "negative_binomial_near";
pub const MODEL_FAR: &str = "negative_binomial_far";

const SAMPLE_OFFSET: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Range {
    Near,
    Far,
}

impl Range {
    fn model(&self) -> &'static str {
        match self {
            Range::Near => MODEL_NEAR,
            Range::Far => MODEL_FAR,
        }
    }
}

/// One side of the distance split, with the design shared by fitting and
/// prediction. Only the offsets differ between the two.
struct Subset {
    range: Range,
    /// Positions in [`GravityData::rows`].
    rows: Vec<usize>,
    design: DesignMatrix,
    counts: Vec<f64>,
    /// log((n + 0.1) / population): the sampled share of each origin.
    fit_offset: DVector<f64>,
    /// log((population + 0.1) / population): the whole origin.
    predict_offset: DVector<f64>,
}

struct GravityData {
    /// Survey rows used as origins, which is every row with population > 0.
    origins: Vec<usize>,
    rows: Vec<GravityRow>,
    near: Subset,
    far: Subset,
}

struct GravityRow {
    /// Position in `GravityData::origins`.
    slot: usize,
    long: LongRow,
}

impl GravityData {
    fn new(table: &SurveyTable, parameters: &Parameters) -> Result<Self, TravelError> {
        let mut slots = vec![None; table.len()];
        let mut origins = Vec::new();
        for (i, area) in table.areas.iter().enumerate() {
            if area.population > 0.0 {
                slots[i] = Some(origins.len());
                origins.push(i);
            }
        }
        if origins.len() < table.len() {
            log::warn!(
                "{MODEL}: dropped {} origins with non-positive population",
                table.len() - origins.len()
            );
        }

        let rows: Vec<GravityRow> = table
            .long_rows(parameters.off_island_population)
            .into_iter()
            .filter_map(|long| slots[long.origin].map(|slot| GravityRow { slot, long }))
            .collect();
        if let Some(row) = rows.iter().find(|r| r.long.destination_population <= 0.0) {
            return Err(TravelError::Data {
                message: format!(
                    "destination {} has population {}",
                    row.long.destination, row.long.destination_population
                ),
            });
        }

        let (near, far): (Vec<usize>, Vec<usize>) =
            (0..rows.len()).partition(|&r| rows[r].long.distance < parameters.distance_cutoff);
        let near = Subset::new(table, &rows, near, Range::Near)?;
        let far = Subset::new(table, &rows, far, Range::Far)?;

        Ok(GravityData {
            origins,
            rows,
            near,
            far,
        })
    }

    /// Destination weights for one pair of coefficient vectors, one row per
    /// origin in [`GravityData::origins`] order.
    fn weights(&self, near: &DVector<f64>, far: &DVector<f64>) -> DMatrix<f64> {
        let mut counts = DMatrix::zeros(self.origins.len(), DESTINATION_COUNT);
        for (subset, coefficients) in [(&self.near, near), (&self.far, far)] {
            let predicted = predict_with_coefficients(
                &subset.design.matrix,
                Link::Log,
                coefficients,
                Some(&subset.predict_offset),
            );
            for (k, &r) in subset.rows.iter().enumerate() {
                let row = &self.rows[r];
                counts[(row.slot, row.long.destination.index())] = predicted[k];
            }
        }
        normalize_rows(counts)
    }
}

impl Subset {
    fn new(
        table: &SurveyTable,
        all: &[GravityRow],
        rows: Vec<usize>,
        range: Range,
    ) -> Result<Self, TravelError> {
        if rows.is_empty() {
            return Err(TravelError::Data {
                message: format!("no origin and destination pairs for {}", range.model()),
            });
        }
        let long: Vec<&LongRow> = rows.iter().map(|&r| &all[r].long).collect();
        let area = |row: &LongRow| &table.areas[row.origin];

        let ad2: Vec<&str> = long.iter().map(|&r| area(r).ad2.as_str()).collect();
        let levels = factor_levels(ad2.iter().copied());
        let distance: (&str, Vec<f64>) = match range {
            Range::Near => ("distance", long.iter().map(|r| r.distance).collect()),
            Range::Far => ("log_distance", long.iter().map(|r| r.distance.ln()).collect()),
        };
        let design = DesignBuilder::new(long.len())
            .numeric("log_population", long.iter().map(|&r| area(r).population.ln()).collect())
            .numeric(
                "log_destination_population",
                long.iter().map(|r| r.destination_population.ln()).collect(),
            )
            .numeric(distance.0, distance.1)
            .factor("ad2", &ad2, &levels)
            .numeric(
                "distance_to_capital",
                long.iter().map(|&r| area(r).distance_to_capital()).collect(),
            )
            .build();

        let fit_offset = DVector::from_iterator(
            long.len(),
            long.iter().map(|&r| {
                let a = area(r);
                ((a.n as f64 + SAMPLE_OFFSET) / a.population).ln()
            }),
        );
        let predict_offset = DVector::from_iterator(
            long.len(),
            long.iter().map(|&r| {
                let a = area(r);
                ((a.population + SAMPLE_OFFSET) / a.population).ln()
            }),
        );
        log::debug!("{}: {} rows", range.model(), long.len());

        Ok(Subset {
            range,
            counts: long.iter().map(|r| r.count as f64).collect(),
            rows,
            design,
            fit_offset,
            predict_offset,
        })
    }

    fn fit(&self) -> Result<FittedGlm, TravelError> {
        let fit = fit_negative_binomial(&self.design, &self.counts, &self.fit_offset, self.range.model())?;
        fit.log_summary();
        Ok(fit)
    }
}

/// Divides each row by its sum. A row summing to zero becomes NaN and is
/// caught by [`check_weights`].
pub fn normalize_rows(mut weights: DMatrix<f64>) -> DMatrix<f64> {
    for mut row in weights.row_iter_mut() {
        let total = row.sum();
        row /= total;
    }
    weights
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Rejection {
    #[error("non-finite weight for origin {area_id}")]
    NonFinite { area_id: String },
    #[error("negative weight for origin {area_id}")]
    Negative { area_id: String },
    #[error("zero off-island weight for {area_id} ({ad2} {year})")]
    Degenerate { area_id: String, ad2: String, year: i32 },
}

/// Rejects a weight matrix with any negative or non-finite entry, or with a
/// zero off-island weight for an origin in the checked region and year.
/// Rows of `weights` belong to the survey rows listed in `origins`.
pub fn check_weights(
    weights: &DMatrix<f64>,
    table: &SurveyTable,
    origins: &[usize],
    check: &DegenerateCheck,
) -> Result<(), Rejection> {
    for (slot, &origin) in origins.iter().enumerate() {
        let area = &table.areas[origin];
        let row = weights.row(slot);
        if row.iter().any(|w| !w.is_finite()) {
            return Err(Rejection::NonFinite {
                area_id: area.area_id.clone(),
            });
        }
        if row.iter().any(|w| *w < 0.0) {
            return Err(Rejection::Negative {
                area_id: area.area_id.clone(),
            });
        }
        let checked = area.ad2.eq_ignore_ascii_case(&check.ad2) && area.year == check.year;
        if checked && row[Destination::OffIsland.index()] == 0.0 {
            return Err(Rejection::Degenerate {
                area_id: area.area_id.clone(),
                ad2: area.ad2.clone(),
                year: area.year,
            });
        }
    }
    Ok(())
}

/// The fitted weights are always written, so only the narrow region/year
/// check is tolerated there, with a warning.
fn check_fitted_weights(
    weights: &DMatrix<f64>,
    table: &SurveyTable,
    origins: &[usize],
    check: &DegenerateCheck,
) -> Result<(), TravelError> {
    match check_weights(weights, table, origins, check) {
        Ok(()) => Ok(()),
        Err(rejection @ Rejection::Degenerate { .. }) => {
            log::warn!("{MODEL}: fitted weights: {rejection}");
            Ok(())
        }
        Err(rejection) => Err(TravelError::Data {
            message: format!("{MODEL}: fitted weights: {rejection}"),
        }),
    }
}

/// Draws candidates until `n_draws` pass `check` or `nb_candidates` have
/// been tried. Kept draws are numbered from 1 without gaps. Returns the
/// kept draws and the number discarded.
fn keep_valid_draws(
    n_draws: usize,
    nb_candidates: usize,
    mut candidate: impl FnMut() -> DMatrix<f64>,
    check: impl Fn(&DMatrix<f64>) -> Result<(), Rejection>,
) -> (Vec<DestinationDraw>, usize) {
    let mut kept = Vec::with_capacity(n_draws);
    let mut discarded = 0;
    for attempt in 1..=nb_candidates {
        if kept.len() == n_draws {
            break;
        }
        let weights = candidate();
        match check(&weights) {
            Ok(()) => kept.push(DestinationDraw {
                label: DrawLabel::Sample(kept.len() + 1),
                weights,
            }),
            Err(rejection) => {
                discarded += 1;
                log::debug!("{MODEL}: discarded candidate {attempt}: {rejection}");
            }
        }
    }
    (kept, discarded)
}

pub struct GravityOutput {
    pub near: FittedGlm,
    pub far: FittedGlm,
    /// Survey rows of the weight matrices, in order.
    pub origins: Vec<usize>,
    /// The fitted weights first, then each kept draw.
    pub draws: Vec<DestinationDraw>,
    /// Candidates rejected by [`check_weights`].
    pub discarded: usize,
}

pub fn run<R: Rng + ?Sized>(
    table: &SurveyTable,
    parameters: &Parameters,
    rng: &mut R,
) -> Result<GravityOutput, TravelError> {
    let data = GravityData::new(table, parameters)?;
    let near = data.near.fit()?;
    let far = data.far.fit()?;

    let mean = data.weights(&near.coefficients, &far.coefficients);
    check_fitted_weights(&mean, table, &data.origins, &parameters.degenerate_check)?;
    let mut draws = Vec::with_capacity(parameters.n_draws + 1);
    draws.push(DestinationDraw {
        label: DrawLabel::Mean,
        weights: mean,
    });

    let near_mvn = MultivariateNormal::new(near.coefficients.clone(), &near.covariance)?;
    let far_mvn = MultivariateNormal::new(far.coefficients.clone(), &far.covariance)?;
    let (sampled, discarded) = keep_valid_draws(
        parameters.n_draws,
        parameters.nb_candidates,
        || data.weights(&near_mvn.sample(rng), &far_mvn.sample(rng)),
        |weights| check_weights(weights, table, &data.origins, &parameters.degenerate_check),
    );
    let kept = sampled.len();
    draws.extend(sampled);

    if kept < parameters.n_draws {
        log::warn!(
            "{MODEL}: only {kept} of {} draws valid after {} candidates",
            parameters.n_draws,
            parameters.nb_candidates
        );
    } else {
        log::info!("{MODEL}: {kept} draws, {discarded} candidates discarded");
    }

    Ok(GravityOutput {
        near,
        far,
        origins: data.origins,
        draws,
        discarded,
    })
}

#[cfg(test)]
mod test {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::survey::fixtures::synthetic_table;

    fn parameters(n_draws: usize, nb_candidates: usize) -> Parameters {
        Parameters {
            n_draws,
            nb_candidates,
            ..Parameters::default()
        }
    }

    #[test]
    fn test_normalize_rows() {
        let weights = normalize_rows(DMatrix::from_row_slice(2, 2, &[1.0, 3.0, 0.0, 0.0]));
        assert_eq!(weights[(0, 0)], 0.25);
        assert_eq!(weights[(0, 1)], 0.75);
        assert!(weights[(1, 0)].is_nan());
    }

    #[test]
    fn test_check_weights() {
        let table = synthetic_table(5);
        let check = DegenerateCheck::default();
        let moka_2018 = table
            .areas
            .iter()
            .position(|a| a.ad2 == "moka" && a.year == 2018)
            .unwrap();
        let moka_2015 = table
            .areas
            .iter()
            .position(|a| a.ad2 == "moka" && a.year == 2015)
            .unwrap();
        let origins = vec![moka_2015, moka_2018];
        let uniform = DMatrix::from_element(2, 7, 1.0 / 7.0);
        assert_eq!(check_weights(&uniform, &table, &origins, &check), Ok(()));

        // Only the checked year is held to a nonzero off-island weight
        let mut weights = uniform.clone();
        weights[(0, 0)] = 0.0;
        assert_eq!(check_weights(&weights, &table, &origins, &check), Ok(()));
        weights[(1, 0)] = 0.0;
        assert!(matches!(
            check_weights(&weights, &table, &origins, &check),
            Err(Rejection::Degenerate { year: 2018, .. })
        ));

        let mut weights = uniform.clone();
        weights[(0, 3)] = f64::NAN;
        assert!(matches!(
            check_weights(&weights, &table, &origins, &check),
            Err(Rejection::NonFinite { .. })
        ));

        let mut weights = uniform;
        weights[(1, 2)] = -1e-3;
        assert!(matches!(
            check_weights(&weights, &table, &origins, &check),
            Err(Rejection::Negative { .. })
        ));
    }

    #[test]
    fn test_weights_are_normalized() {
        let table = synthetic_table(5);
        let output = run(&table, &parameters(10, 25), &mut StdRng::seed_from_u64(8)).unwrap();

        assert!(output.draws.len() <= 11);
        assert!(output.draws.len() - 1 + output.discarded <= 25);
        assert_eq!(output.draws[0].label, DrawLabel::Mean);
        for (i, draw) in output.draws.iter().enumerate().skip(1) {
            assert_eq!(draw.label, DrawLabel::Sample(i));
        }
        for draw in &output.draws {
            assert_eq!(draw.weights.shape(), (table.len(), 7));
            for row in draw.weights.row_iter() {
                assert!(f64::abs(row.sum() - 1.0) < 1e-9);
                assert!(row.iter().all(|w| w.is_finite() && *w >= 0.0));
            }
        }
        assert_eq!(output.near.names[2], "log_destination_population");
        assert_eq!(output.near.names[3], "distance");
        assert_eq!(output.far.names[3], "log_distance");
    }

    #[test]
    fn test_candidate_budget_bounds_draws() {
        let table = synthetic_table(5);
        let output = run(&table, &parameters(10, 4), &mut StdRng::seed_from_u64(8)).unwrap();
        assert!(output.draws.len() <= 5);
        assert_eq!(output.draws.len() - 1 + output.discarded, 4);
    }

    #[test]
    fn test_unpopulated_origins_are_dropped() {
        let mut table = synthetic_table(5);
        table.areas[0].population = 0.0;
        let output = run(&table, &parameters(1, 2), &mut StdRng::seed_from_u64(8)).unwrap();
        assert_eq!(output.origins.len(), table.len() - 1);
        assert_eq!(output.origins[0], 1);
        assert_eq!(output.draws[0].weights.nrows(), table.len() - 1);
    }

    #[test]
    fn test_empty_subset_is_an_error() {
        let table = synthetic_table(5);
        let parameters = Parameters {
            distance_cutoff: 0.0,
            ..parameters(1, 1)
        };
        let result = run(&table, &parameters, &mut StdRng::seed_from_u64(8));
        assert!(matches!(result, Err(TravelError::Data { .. })));
    }

    fn moka_origins(table: &SurveyTable) -> Vec<usize> {
        [2015, 2018]
            .iter()
            .map(|year| {
                table
                    .areas
                    .iter()
                    .position(|a| a.ad2 == "moka" && a.year == *year)
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_discarded_candidates_are_skipped() {
        let table = synthetic_table(5);
        let origins = moka_origins(&table);
        let check = DegenerateCheck::default();

        let good = DMatrix::from_element(2, 7, 1.0 / 7.0);
        let mut degenerate = DMatrix::from_element(2, 7, 1.0 / 6.0);
        degenerate[(1, 0)] = 0.0;
        let mut not_finite = good.clone();
        not_finite[(0, 4)] = f64::NAN;
        let mut second = DMatrix::from_element(2, 7, 0.1);
        second.column_mut(0).fill(0.4);
        let candidates = vec![good.clone(), degenerate, not_finite, second.clone(), good.clone()];

        let mut calls = 0;
        let (kept, discarded) = keep_valid_draws(
            2,
            candidates.len(),
            || {
                calls += 1;
                candidates[calls - 1].clone()
            },
            |weights| check_weights(weights, &table, &origins, &check),
        );
        assert_eq!(calls, 4);
        assert_eq!(discarded, 2);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].label, DrawLabel::Sample(1));
        assert_eq!(kept[0].weights, good);
        assert_eq!(kept[1].label, DrawLabel::Sample(2));
        assert_eq!(kept[1].weights, second);
    }

    #[test]
    fn test_fitted_weights_must_be_finite() {
        let table = synthetic_table(5);
        let origins = moka_origins(&table);
        let check = DegenerateCheck::default();

        // The narrow region/year case only warns for the fitted weights
        let mut weights = DMatrix::from_element(2, 7, 1.0 / 6.0);
        weights[(1, 0)] = 0.0;
        assert!(check_fitted_weights(&weights, &table, &origins, &check).is_ok());

        weights[(0, 2)] = f64::NAN;
        assert!(matches!(
            check_fitted_weights(&weights, &table, &origins, &check),
            Err(TravelError::Data { .. })
        ));
    }

    #[test]
    fn test_unobserved_pair_is_smoothed() {
        let mut table = synthetic_table(5);
        table.areas[0].trips[Destination::Ureka.index()] = 0;

        let output = run(&table, &parameters(0, 0), &mut StdRng::seed_from_u64(8)).unwrap();
        assert_eq!(output.origins[0], 0);
        let mean = &output.draws[0].weights;
        assert!(mean[(0, Destination::Ureka.index())] > 0.0);
    }

    #[test]
    fn test_mean_is_reproducible() {
        let table = synthetic_table(5);
        let a = run(&table, &parameters(2, 4), &mut StdRng::seed_from_u64(8)).unwrap();
        let b = run(&table, &parameters(2, 4), &mut StdRng::seed_from_u64(9)).unwrap();
        assert_eq!(a.near.coefficients, b.near.coefficients);
        assert_eq!(a.far.coefficients, b.far.coefficients);
        assert_eq!(a.draws[0], b.draws[0]);
        if a.draws.len() > 1 && b.draws.len() > 1 {
            assert_ne!(a.draws[1], b.draws[1]);
        }

        let again = run(&table, &parameters(2, 4), &mut StdRng::seed_from_u64(8)).unwrap();
        assert_eq!(a.draws, again.draws);
    }
}
