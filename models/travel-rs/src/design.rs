use std::collections::BTreeSet;

use nalgebra::DMatrix;

pub const INTERCEPT: &str = "(Intercept)";

/// A model matrix with named columns. Column 0 is always the intercept.
#[derive(Debug, Clone)]
pub struct DesignMatrix {
    pub names: Vec<String>,
    pub matrix: DMatrix<f64>,
}

impl DesignMatrix {
    pub fn nrows(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.matrix.ncols()
    }
}

pub struct DesignBuilder {
    nrows: usize,
    names: Vec<String>,
    columns: Vec<Vec<f64>>,
}

impl DesignBuilder {
    pub fn new(nrows: usize) -> Self {
        DesignBuilder {
            nrows,
            names: vec![INTERCEPT.to_string()],
            columns: vec![vec![1.0; nrows]],
        }
    }

    pub fn numeric(mut self, name: &str, values: Vec<f64>) -> Self {
        assert_eq!(values.len(), self.nrows, "column {name} has the wrong length");
        self.names.push(name.to_string());
        self.columns.push(values);
        self
    }

    /// Treatment-coded indicators for every level but the first.
    pub fn factor<S: AsRef<str>>(mut self, name: &str, values: &[S], levels: &[String]) -> Self {
        assert_eq!(values.len(), self.nrows, "factor {name} has the wrong length");
        for level in levels.iter().skip(1) {
            self.names.push(format!("{name}{level}"));
            self.columns.push(
                values
                    .iter()
                    .map(|v| if v.as_ref() == level.as_str() { 1.0 } else { 0.0 })
                    .collect(),
            );
        }
        self
    }

    pub fn build(self) -> DesignMatrix {
        let columns = self.columns;
        let matrix = DMatrix::from_fn(self.nrows, columns.len(), |i, j| columns[j][i]);
        DesignMatrix {
            names: self.names,
            matrix,
        }
    }
}

/// Sorted distinct levels of a categorical variable.
pub fn factor_levels<'a>(values: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    values
        .into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// A centered and scaled copy of a design, with the map back to raw scale.
///
/// If `b` are coefficients on the standardized columns, `transform * b` are
/// the same coefficients on the raw columns.
pub struct Standardized {
    pub matrix: DMatrix<f64>,
    pub transform: DMatrix<f64>,
}

pub fn standardize(x: &DMatrix<f64>) -> Standardized {
    let (n, p) = x.shape();
    let mut matrix = x.clone();
    let mut transform = DMatrix::identity(p, p);
    for j in 1..p {
        let column = x.column(j);
        let mean = column.mean();
        let sd = (column.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64).sqrt();
        // Constant columns stay as they are and show up later as a singular fit.
        if sd == 0.0 || !sd.is_finite() {
            continue;
        }
        for i in 0..n {
            matrix[(i, j)] = (x[(i, j)] - mean) / sd;
        }
        transform[(j, j)] = 1.0 / sd;
        transform[(0, j)] = -mean / sd;
    }
    Standardized { matrix, transform }
}
