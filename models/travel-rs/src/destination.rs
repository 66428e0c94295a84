//! Where people go when they leave: a multinomial logit over the seven
//! destinations, fitted to one observation per surveyed trip.

use rand::Rng;

use crate::design::{DesignBuilder, DesignMatrix};
use crate::glm::FitError;
use crate::multinom::{
    MultinomialFit, TripObservation, destination_probabilities, fit_multinomial, unflatten,
};
use crate::mvn::MultivariateNormal;
use crate::output::{DestinationDraw, DrawLabel};
use crate::parameters::Parameters;
use crate::survey::{Destination, LongRow, SurveyTable};

pub const MODEL: &str = "multinomial";

/// Repeats each long row once per recorded trip.
pub fn expand_trips(rows: &[LongRow]) -> Vec<TripObservation> {
    rows.iter()
        .flat_map(|row| {
            let observation = TripObservation {
                row: row.origin,
                category: row.destination.index(),
            };
            std::iter::repeat_n(observation, row.count as usize)
        })
        .collect()
}

/// One row per origin: population, the distance to every destination and
/// the origin region.
pub fn design(table: &SurveyTable) -> DesignMatrix {
    let ad2: Vec<&str> = table.areas.iter().map(|a| a.ad2.as_str()).collect();
    let mut builder = DesignBuilder::new(table.len())
        .numeric("population", table.areas.iter().map(|a| a.population).collect());
    for destination in Destination::ALL {
        builder = builder.numeric(
            &format!("dist.{destination}"),
            table.areas.iter().map(|a| a.distance_to(destination)).collect(),
        );
    }
    builder.factor("ad2", &ad2, &table.ad2_levels()).build()
}

pub struct MultinomialOutput {
    pub fit: MultinomialFit,
    /// Survey rows of the weight matrices, in order.
    pub origins: Vec<usize>,
    /// The fitted probabilities first, then one entry per draw.
    pub draws: Vec<DestinationDraw>,
}

pub fn run<R: Rng + ?Sized>(
    table: &SurveyTable,
    parameters: &Parameters,
    rng: &mut R,
) -> Result<MultinomialOutput, FitError> {
    let observations = expand_trips(&table.long_rows(parameters.off_island_population));
    log::info!("{MODEL}: {} trips from {} origins", observations.len(), table.len());

    let design = design(table);
    let fit = fit_multinomial(
        &design,
        &observations,
        Destination::labels(),
        parameters.reference_destination.index(),
        MODEL,
    )?;
    fit.log_summary();

    let rows = fit.coefficients.nrows();
    let p = fit.coefficients.ncols();
    let mvn = MultivariateNormal::new(fit.flat_coefficients(), &fit.covariance)?;

    let mut draws = Vec::with_capacity(parameters.n_draws + 1);
    draws.push(DestinationDraw {
        label: DrawLabel::Mean,
        weights: fit.predict(&design.matrix),
    });
    for (i, flat) in mvn.sample_n(parameters.n_draws, rng).iter().enumerate() {
        let coefficients = unflatten(flat, rows, p);
        draws.push(DestinationDraw {
            label: DrawLabel::Sample(i + 1),
            weights: destination_probabilities(&design.matrix, &coefficients, fit.reference),
        });
    }
    log::info!("{MODEL}: {} draws", parameters.n_draws);

    Ok(MultinomialOutput {
        fit,
        origins: (0..table.len()).collect(),
        draws,
    })
}
