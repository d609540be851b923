//! Labelled tabular datasets loaded from CSV.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Feature columns of the iris dataset
pub const IRIS_FEATURES: [&str; 4] = [
    "SepalLengthCm",
    "SepalWidthCm",
    "PetalLengthCm",
    "PetalWidthCm",
];

/// Label column of the iris dataset
pub const IRIS_LABEL: &str = "Species";

/// Share of rows held out for evaluation
pub const DEFAULT_TEST_FRACTION: f64 = 0.3;

/// Which CSV columns are features and which is the label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSchema {
    pub features: Vec<String>,
    pub label: String,
}

impl Default for DatasetSchema {
    fn default() -> Self {
        Self {
            features: IRIS_FEATURES.iter().map(|s| s.to_string()).collect(),
            label: IRIS_LABEL.to_string(),
        }
    }
}

/// One labelled row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub features: Vec<f64>,
    pub label: String,
}

/// An ordered set of samples sharing one schema
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    schema: DatasetSchema,
    samples: Vec<Sample>,
}

impl Dataset {
    pub fn new(schema: DatasetSchema, samples: Vec<Sample>) -> Self {
        Self { schema, samples }
    }

    /// Load a CSV file with a header row
    pub fn load(path: &Path, schema: &DatasetSchema) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read dataset: {}", path.display()))?;

        Self::from_csv(&content, schema)
            .with_context(|| format!("Invalid dataset: {}", path.display()))
    }

    /// Parse CSV content with a header row
    pub fn from_csv(content: &str, schema: &DatasetSchema) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(content.as_bytes());

        let columns = reader.headers().context("Failed to read header row")?.clone();
        if columns.is_empty() {
            bail!("Dataset is empty");
        }

        let column_of = |name: &str| {
            columns
                .iter()
                .position(|c| c == name)
                .with_context(|| format!("Missing column '{}'", name))
        };
        let feature_columns = schema
            .features
            .iter()
            .map(|name| column_of(name))
            .collect::<Result<Vec<_>>>()?;
        let label_column = column_of(&schema.label)?;

        let mut samples = Vec::new();
        for record in reader.records() {
            let record = record.context("Malformed CSV record")?;
            let line_no = record.position().map(|p| p.line()).unwrap_or_default();

            let mut features = Vec::with_capacity(feature_columns.len());
            for &col in &feature_columns {
                let value: f64 = record[col].parse().with_context(|| {
                    format!("Line {}: '{}' is not a number ({})", line_no, &record[col], &columns[col])
                })?;
                if !value.is_finite() {
                    bail!("Line {}: non-finite value in {}", line_no, &columns[col]);
                }
                features.push(value);
            }

            let label = &record[label_column];
            if label.is_empty() {
                bail!("Line {}: empty label", line_no);
            }

            samples.push(Sample {
                features,
                label: label.to_string(),
            });
        }

        Ok(Self::new(schema.clone(), samples))
    }

    pub fn schema(&self) -> &DatasetSchema {
        &self.schema
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.samples.iter().map(|s| s.label.as_str())
    }

    /// Split into (train, test), holding out `test_fraction` of the rows.
    ///
    /// Held-out rows are spread evenly over the file, so a dataset sorted
    /// by label still yields every label in both halves. The split is
    /// deterministic: training and inference see the same held-out rows.
    pub fn split(&self, test_fraction: f64) -> (Dataset, Dataset) {
        let per_mille = (test_fraction.clamp(0.0, 1.0) * 1000.0).round() as usize;
        let mut train = Vec::new();
        let mut test = Vec::new();

        for (i, sample) in self.samples.iter().enumerate() {
            let held_out = (i + 1) * per_mille / 1000 > i * per_mille / 1000;
            if held_out {
                test.push(sample.clone());
            } else {
                train.push(sample.clone());
            }
        }

        (
            Self::new(self.schema.clone(), train),
            Self::new(self.schema.clone(), test),
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A small iris-shaped dataset, sorted by species like the original
    pub(crate) fn iris_sample() -> String {
        let mut csv = String::from(
            "Id,SepalLengthCm,SepalWidthCm,PetalLengthCm,PetalWidthCm,Species\n",
        );
        let classes = [
            ("Iris-setosa", [5.0, 3.4, 1.5, 0.2]),
            ("Iris-versicolor", [5.9, 2.8, 4.3, 1.3]),
            ("Iris-virginica", [6.6, 3.0, 5.6, 2.1]),
        ];
        let mut id = 1;
        for (label, base) in classes {
            for j in 0..10 {
                let jitter = (j as f64 - 4.5) * 0.02;
                csv.push_str(&format!(
                    "{},{:.2},{:.2},{:.2},{:.2},{}\n",
                    id,
                    base[0] + jitter,
                    base[1] - jitter,
                    base[2] + jitter,
                    base[3] + jitter / 2.0,
                    label
                ));
                id += 1;
            }
        }
        csv
    }

    #[test]
    fn test_parse_iris_csv() {
        let dataset = Dataset::from_csv(&iris_sample(), &DatasetSchema::default()).unwrap();

        assert_eq!(dataset.len(), 30);
        assert_eq!(dataset.samples()[0].features.len(), 4);
        assert_eq!(dataset.samples()[0].label, "Iris-setosa");
        assert_eq!(dataset.samples()[29].label, "Iris-virginica");
    }

    #[test]
    fn test_missing_column() {
        let csv = "SepalLengthCm,Species\n5.1,Iris-setosa\n";
        let err = Dataset::from_csv(csv, &DatasetSchema::default()).unwrap_err();
        assert!(err.to_string().contains("SepalWidthCm"));
    }

    #[test]
    fn test_bad_number_reports_line() {
        let csv = "SepalLengthCm,SepalWidthCm,PetalLengthCm,PetalWidthCm,Species\n\
                   5.1,3.5,1.4,0.2,Iris-setosa\n\
                   abc,3.0,1.4,0.2,Iris-setosa\n";
        let err = Dataset::from_csv(csv, &DatasetSchema::default()).unwrap_err();
        assert!(format!("{:#}", err).contains("Line 3"));
    }

    #[test]
    fn test_quoted_label_with_comma() {
        let csv = "SepalLengthCm,SepalWidthCm,PetalLengthCm,PetalWidthCm,Species\n\
                   5.1,3.5,1.4,0.2,\"Iris, setosa\"\n";
        let dataset = Dataset::from_csv(csv, &DatasetSchema::default()).unwrap();

        assert_eq!(dataset.len(), 1);
        assert_eq!(dataset.samples()[0].label, "Iris, setosa");
    }

    #[test]
    fn test_ragged_row_is_rejected() {
        let csv = "SepalLengthCm,SepalWidthCm,PetalLengthCm,PetalWidthCm,Species\n\
                   5.1,3.5,1.4,0.2\n";
        assert!(Dataset::from_csv(csv, &DatasetSchema::default()).is_err());
    }

    #[test]
    fn test_split_is_deterministic_and_balanced() {
        let dataset = Dataset::from_csv(&iris_sample(), &DatasetSchema::default()).unwrap();

        let (train, test) = dataset.split(DEFAULT_TEST_FRACTION);
        assert_eq!(test.len(), 9);
        assert_eq!(train.len(), 21);

        for label in ["Iris-setosa", "Iris-versicolor", "Iris-virginica"] {
            assert_eq!(test.labels().filter(|l| *l == label).count(), 3);
        }

        let (_, again) = dataset.split(DEFAULT_TEST_FRACTION);
        assert_eq!(again, test);
    }
}
