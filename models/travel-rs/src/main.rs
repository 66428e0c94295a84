pub mod design;
pub mod destination;
pub mod error;
pub mod frequency;
pub mod glm;
pub mod gravity;
pub mod multinom;
pub mod mvn;
pub mod nbinom;
pub mod output;
pub mod parameters;
pub mod survey;

use error::TravelError;
use output::{KeyLayout, Table};
use parameters::{Parameters, Pipeline};
use survey::SurveyTable;

type Environment = mrp::Environment<Parameters>;

fn write_table(ctx: &mut Environment, filename: &str, table: &Table) -> Result<(), TravelError> {
    ctx.write_csv(filename, &table.header_refs(), &table.rows)?;
    Ok(())
}

const PIPELINE_ORDER: [Pipeline; 3] = [
    Pipeline::Frequency,
    Pipeline::Multinomial,
    Pipeline::NegativeBinomial,
];

/// Files a run writes for the selected pipelines, the manifest included.
fn output_count(pipelines: &[Pipeline]) -> usize {
    let tables: usize = PIPELINE_ORDER
        .iter()
        .filter(|p| pipelines.contains(p))
        .map(|p| match p {
            Pipeline::Frequency => 3,
            Pipeline::Multinomial => 2,
            Pipeline::NegativeBinomial => 3,
        })
        .sum();
    tables + 1
}

fn main() -> Result<(), TravelError> {
    pretty_env_logger::init();

    let mut ctx = Environment::load()?;
    execute(&mut ctx)
}

fn execute(ctx: &mut Environment) -> Result<(), TravelError> {
    let mut parameters = ctx.input.take().ok_or(TravelError::MissingInput)?;
    parameters.seed = ctx.seed;
    parameters.replicate = ctx.replicate;

    let survey_path = ctx
        .file("survey")
        .ok_or(TravelError::MissingFile("survey"))?
        .to_path_buf();
    let distance_path = ctx
        .file("distance")
        .ok_or(TravelError::MissingFile("distance"))?
        .to_path_buf();
    ctx.record_input("survey", &survey_path)?;
    ctx.record_input("distance", &distance_path)?;

    let table = SurveyTable::load(&survey_path, &distance_path)?;
    log::info!(
        "loaded {} survey rows, seed {}, replicate {}",
        table.len(),
        parameters.seed,
        parameters.replicate
    );

    if ctx.output_dir().is_none() {
        let count = output_count(&parameters.pipelines);
        if count > 1 {
            log::warn!("no filesystem output configured, {count} CSV files will be written to stdout back to back");
        }
    }

    for pipeline in PIPELINE_ORDER {
        if !parameters.pipelines.contains(&pipeline) {
            log::info!("skipping {pipeline:?}");
            continue;
        }
        let mut rng = parameters.rng(pipeline);
        match pipeline {
            Pipeline::Frequency => {
                let result = frequency::run(&table, &parameters, &mut rng)?;
                write_table(ctx, "frequency_draws.csv", &output::frequency_draws(&table, &result))?;
                write_table(ctx, "frequency_rates.csv", &output::frequency_rates(&table, &result))?;
                write_table(
                    ctx,
                    "frequency_coefficients.csv",
                    &output::coefficients(&result.fit.summary()),
                )?;
            }
            Pipeline::Multinomial => {
                let result = destination::run(&table, &parameters, &mut rng)?;
                let draws = output::destination_draws(
                    &table,
                    &result.origins,
                    &result.draws,
                    KeyLayout::Multinomial,
                );
                write_table(ctx, "multinomial_draws.csv", &draws)?;
                write_table(
                    ctx,
                    "multinomial_coefficients.csv",
                    &output::coefficients(&result.fit.summary()),
                )?;
            }
            Pipeline::NegativeBinomial => {
                let result = gravity::run(&table, &parameters, &mut rng)?;
                let draws = output::destination_draws(
                    &table,
                    &result.origins,
                    &result.draws,
                    KeyLayout::NegativeBinomial,
                );
                write_table(ctx, "negative_binomial_draws.csv", &draws)?;
                write_table(
                    ctx,
                    "negative_binomial_near_coefficients.csv",
                    &output::coefficients(&result.near.summary()),
                )?;
                write_table(
                    ctx,
                    "negative_binomial_far_coefficients.csv",
                    &output::coefficients(&result.far.summary()),
                )?;
            }
        }
    }

    ctx.write_manifest()?;
    Ok(())
}
