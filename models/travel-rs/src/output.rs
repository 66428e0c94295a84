use std::fmt;

use nalgebra::DMatrix;

use crate::frequency::FrequencyOutput;
use crate::glm::CoefficientSummary;
use crate::survey::{Destination, SurveyTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawLabel {
    Mean,
    /// 1-based draw index.
    Sample(usize),
}

impl fmt::Display for DrawLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DrawLabel::Mean => f.write_str("draw.mean"),
            DrawLabel::Sample(i) => write!(f, "draw.{i}"),
        }
    }
}

/// Destination probabilities or weights for one draw: one row per origin,
/// one column per destination in [`Destination::ALL`] order.
#[derive(Debug, Clone, PartialEq)]
pub struct DestinationDraw {
    pub label: DrawLabel,
    pub weights: DMatrix<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn header_refs(&self) -> Vec<&str> {
        self.headers.iter().map(String::as_str).collect()
    }
}

pub fn frequency_draws(table: &SurveyTable, output: &FrequencyOutput) -> Table {
    let mut headers = vec!["areaId".to_string(), "year".to_string()];
    headers.push(DrawLabel::Mean.to_string());
    headers.extend((1..=output.draws.len()).map(|i| DrawLabel::Sample(i).to_string()));

    let rows = table
        .areas
        .iter()
        .enumerate()
        .map(|(i, area)| {
            let mut row = vec![area.area_id.clone(), area.year.to_string()];
            row.push(output.mean[i].to_string());
            row.extend(output.draws.iter().map(|draw| draw[i].to_string()));
            row
        })
        .collect();
    Table { headers, rows }
}

pub fn frequency_rates(table: &SurveyTable, output: &FrequencyOutput) -> Table {
    let headers = ["areaId", "ad2", "year", "probability", "daily_rate"]
        .map(String::from)
        .to_vec();
    let rows = table
        .areas
        .iter()
        .zip(&output.rates)
        .map(|(area, rate)| {
            vec![
                area.area_id.clone(),
                area.ad2.clone(),
                area.year.to_string(),
                rate.probability.to_string(),
                rate.daily_rate.to_string(),
            ]
        })
        .collect();
    Table { headers, rows }
}

/// Which identifying columns precede `draw` in a destination table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyLayout {
    /// areaId, ad2, population, year
    Multinomial,
    /// areaId, year, ad2, population
    NegativeBinomial,
}

impl KeyLayout {
    fn headers(&self) -> [&'static str; 4] {
        match self {
            KeyLayout::Multinomial => ["areaId", "ad2", "population", "year"],
            KeyLayout::NegativeBinomial => ["areaId", "year", "ad2", "population"],
        }
    }
}

/// Long destination table, draws in order and origins in survey order
/// within each draw. `origins` maps weight rows to survey rows.
pub fn destination_draws(
    table: &SurveyTable,
    origins: &[usize],
    draws: &[DestinationDraw],
    layout: KeyLayout,
) -> Table {
    let mut headers: Vec<String> = layout.headers().map(String::from).to_vec();
    headers.push("draw".to_string());
    headers.extend(Destination::labels());

    let mut rows = Vec::with_capacity(draws.len() * origins.len());
    for draw in draws {
        for (r, &origin) in origins.iter().enumerate() {
            let area = &table.areas[origin];
            let mut row = match layout {
                KeyLayout::Multinomial => vec![
                    area.area_id.clone(),
                    area.ad2.clone(),
                    area.population.to_string(),
                    area.year.to_string(),
                ],
                KeyLayout::NegativeBinomial => vec![
                    area.area_id.clone(),
                    area.year.to_string(),
                    area.ad2.clone(),
                    area.population.to_string(),
                ],
            };
            row.push(draw.label.to_string());
            row.extend(draw.weights.row(r).iter().map(|w| w.to_string()));
            rows.push(row);
        }
    }
    Table { headers, rows }
}

pub fn coefficients(summary: &[CoefficientSummary]) -> Table {
    let headers = ["term", "estimate", "std_error", "z_value"]
        .map(String::from)
        .to_vec();
    let rows = summary
        .iter()
        .map(|s| {
            vec![
                s.term.clone(),
                s.estimate.to_string(),
                s.std_error.to_string(),
                s.z_value.to_string(),
            ]
        })
        .collect();
    Table { headers, rows }
}
