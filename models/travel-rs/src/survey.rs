//! Travel survey tables: per-area trip counts joined with distances to
//! each destination region.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::design::factor_levels;
use crate::error::TravelError;

pub const DESTINATION_COUNT: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    OffIsland,
    Malabo,
    Baney,
    Luba,
    Riaba,
    Moka,
    Ureka,
}

impl Destination {
    /// Column order used by every table and model.
    pub const ALL: [Destination; DESTINATION_COUNT] = [
        Destination::OffIsland,
        Destination::Malabo,
        Destination::Baney,
        Destination::Luba,
        Destination::Riaba,
        Destination::Moka,
        Destination::Ureka,
    ];

    pub const CAPITAL: Destination = Destination::Malabo;

    pub fn name(&self) -> &'static str {
        match self {
            Destination::OffIsland => "off_island",
            Destination::Malabo => "malabo",
            Destination::Baney => "baney",
            Destination::Luba => "luba",
            Destination::Riaba => "riaba",
            Destination::Moka => "moka",
            Destination::Ureka => "ureka",
        }
    }

    pub fn index(&self) -> usize {
        *self as usize
    }

    /// The administrative region this destination stands for, if on-island.
    pub fn region(&self) -> Option<&'static str> {
        match self {
            Destination::OffIsland => None,
            other => Some(other.name()),
        }
    }

    pub fn labels() -> Vec<String> {
        Destination::ALL.iter().map(|d| d.name().to_string()).collect()
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Deserialize)]
struct SurveyRow {
    #[serde(rename = "areaId")]
    area_id: String,
    ad2: String,
    year: i32,
    n: u32,
    #[serde(rename = "trip.counts")]
    trip_counts: u32,
    #[serde(rename = "trips.off_island")]
    off_island: u32,
    #[serde(rename = "trips.malabo")]
    malabo: u32,
    #[serde(rename = "trips.baney")]
    baney: u32,
    #[serde(rename = "trips.luba")]
    luba: u32,
    #[serde(rename = "trips.riaba")]
    riaba: u32,
    #[serde(rename = "trips.moka")]
    moka: u32,
    #[serde(rename = "trips.ureka")]
    ureka: u32,
    population: f64,
}

#[derive(Debug, Deserialize)]
struct DistanceRow {
    #[serde(rename = "areaId")]
    area_id: String,
    #[serde(rename = "dist.off_island")]
    off_island: f64,
    #[serde(rename = "dist.malabo")]
    malabo: f64,
    #[serde(rename = "dist.baney")]
    baney: f64,
    #[serde(rename = "dist.luba")]
    luba: f64,
    #[serde(rename = "dist.riaba")]
    riaba: f64,
    #[serde(rename = "dist.moka")]
    moka: f64,
    #[serde(rename = "dist.ureka")]
    ureka: f64,
}

/// One surveyed area in one year, joined with its distances.
#[derive(Debug, Clone, PartialEq)]
pub struct SurveyArea {
    pub area_id: String,
    pub ad2: String,
    pub year: i32,
    /// People surveyed.
    pub n: u32,
    /// People who left the area during the survey period, at most `n`.
    pub trip_counts: u32,
    /// Trips per destination, in [`Destination::ALL`] order.
    pub trips: [u32; DESTINATION_COUNT],
    pub population: f64,
    pub distances: [f64; DESTINATION_COUNT],
}

impl SurveyArea {
    pub fn trips_to(&self, destination: Destination) -> u32 {
        self.trips[destination.index()]
    }

    pub fn distance_to(&self, destination: Destination) -> f64 {
        self.distances[destination.index()]
    }

    pub fn distance_to_capital(&self) -> f64 {
        self.distance_to(Destination::CAPITAL)
    }
}

/// One origin and destination pair of the long-form table.
#[derive(Debug, Clone, PartialEq)]
pub struct LongRow {
    /// Index of the origin in [`SurveyTable::areas`].
    pub origin: usize,
    pub destination: Destination,
    pub count: u32,
    pub distance: f64,
    pub destination_population: f64,
}

#[derive(Debug, Clone, Default)]
pub struct SurveyTable {
    pub areas: Vec<SurveyArea>,
}

impl SurveyTable {
    pub fn load(survey: &Path, distance: &Path) -> Result<Self, TravelError> {
        let survey_rows = read_rows::<SurveyRow, _>(open(survey)?, survey)?;
        let distance_rows = read_rows::<DistanceRow, _>(open(distance)?, distance)?;
        Self::join(survey_rows, distance_rows)
    }

    pub fn from_readers<R: Read, S: Read>(survey: R, distance: S) -> Result<Self, TravelError> {
        let survey_rows = read_rows::<SurveyRow, _>(survey, Path::new("<survey>"))?;
        let distance_rows = read_rows::<DistanceRow, _>(distance, Path::new("<distance>"))?;
        Self::join(survey_rows, distance_rows)
    }

    /// Inner join on areaId, keeping survey order. Survey rows without a
    /// distance row are dropped.
    fn join(survey: Vec<SurveyRow>, distance: Vec<DistanceRow>) -> Result<Self, TravelError> {
        let distances: HashMap<String, [f64; DESTINATION_COUNT]> = distance
            .into_iter()
            .map(|d| {
                (
                    d.area_id,
                    [d.off_island, d.malabo, d.baney, d.luba, d.riaba, d.moka, d.ureka],
                )
            })
            .collect();

        let total = survey.len();
        let areas: Vec<SurveyArea> = survey
            .into_iter()
            .filter_map(|row| {
                let distances = *distances.get(&row.area_id)?;
                let mut trip_counts = row.trip_counts;
                if trip_counts > row.n {
                    log::warn!(
                        "area {} ({}): trip.counts {} exceeds n {}, clamping",
                        row.area_id,
                        row.year,
                        trip_counts,
                        row.n
                    );
                    trip_counts = row.n;
                }
                Some(SurveyArea {
                    trips: [
                        row.off_island,
                        row.malabo,
                        row.baney,
                        row.luba,
                        row.riaba,
                        row.moka,
                        row.ureka,
                    ],
                    area_id: row.area_id,
                    ad2: row.ad2,
                    year: row.year,
                    n: row.n,
                    trip_counts,
                    population: row.population,
                    distances,
                })
            })
            .collect();

        if areas.len() < total {
            log::debug!(
                "dropped {} survey rows with no matching distance row",
                total - areas.len()
            );
        }
        if areas.is_empty() {
            return Err(TravelError::EmptyTable);
        }
        Ok(SurveyTable { areas })
    }

    pub fn len(&self) -> usize {
        self.areas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }

    pub fn ad2_levels(&self) -> Vec<String> {
        factor_levels(self.areas.iter().map(|a| a.ad2.as_str()))
    }

    /// Aggregate population of each destination. On-island regions sum
    /// their areas' populations and divide by the number of survey years
    /// the region appears in.
    pub fn destination_populations(&self, off_island_population: f64) -> [f64; DESTINATION_COUNT] {
        let mut populations = [0.0; DESTINATION_COUNT];
        for destination in Destination::ALL {
            populations[destination.index()] = match destination.region() {
                None => off_island_population,
                Some(region) => {
                    let members: Vec<&SurveyArea> = self
                        .areas
                        .iter()
                        .filter(|a| a.ad2.eq_ignore_ascii_case(region))
                        .collect();
                    let years: BTreeSet<i32> = members.iter().map(|a| a.year).collect();
                    if years.is_empty() {
                        0.0
                    } else {
                        members.iter().map(|a| a.population).sum::<f64>() / years.len() as f64
                    }
                }
            };
        }
        populations
    }

    /// Reshapes to one row per origin and destination, origins in survey
    /// order and destinations in [`Destination::ALL`] order.
    pub fn long_rows(&self, off_island_population: f64) -> Vec<LongRow> {
        let populations = self.destination_populations(off_island_population);
        self.areas
            .iter()
            .enumerate()
            .flat_map(|(origin, area)| {
                Destination::ALL.into_iter().map(move |destination| LongRow {
                    origin,
                    destination,
                    count: area.trips_to(destination),
                    distance: area.distance_to(destination),
                    destination_population: populations[destination.index()],
                })
            })
            .collect()
    }
}

fn open(path: &Path) -> Result<std::fs::File, TravelError> {
    std::fs::File::open(path).map_err(|e| TravelError::Csv {
        path: path.to_path_buf(),
        source: e.into(),
    })
}

fn read_rows<T: serde::de::DeserializeOwned, R: Read>(
    reader: R,
    path: &Path,
) -> Result<Vec<T>, TravelError> {
    csv::Reader::from_reader(reader)
        .deserialize()
        .collect::<Result<Vec<T>, csv::Error>>()
        .map_err(|source| TravelError::Csv {
            path: path.to_path_buf(),
            source,
        })
}
