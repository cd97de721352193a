use serde::{Deserialize, Serialize};

/// Rates expressed as decimals (0.05 = 5%). Never as percentages.
pub type Rate = f64;

/// Portfolio weights, positionally aligned with the asset names of the input.
pub type WeightVector = Vec<f64>;

/// A (lower, upper) limit on a single asset weight.
pub type WeightBounds = (f64, f64);

/// Standard computation output envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputationOutput<T: Serialize> {
    pub result: T,
    pub methodology: String,
    pub assumptions: serde_json::Value,
    pub warnings: Vec<String>,
    pub metadata: ComputationMetadata,
}

/// Metadata for every computation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputationMetadata {
    pub version: String,
    pub computation_time_us: u64,
    pub precision: String,
}

/// Helper to wrap computation results with metadata
pub fn with_metadata<T: Serialize>(
    methodology: &str,
    assumptions: &impl Serialize,
    warnings: Vec<String>,
    elapsed_us: u64,
    result: T,
) -> ComputationOutput<T> {
    ComputationOutput {
        result,
        methodology: methodology.to_string(),
        assumptions: serde_json::to_value(assumptions).unwrap_or_default(),
        warnings,
        metadata: ComputationMetadata {
            version: env!("CARGO_PKG_VERSION").to_string(),
            computation_time_us: elapsed_us,
            precision: "f64".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_metadata_envelope() {
        let out = with_metadata(
            "Test",
            &serde_json::json!({ "n_assets": 2 }),
            vec!["careful".into()],
            42,
            1.5_f64,
        );
        assert_eq!(out.methodology, "Test");
        assert_eq!(out.assumptions["n_assets"], 2);
        assert_eq!(out.warnings, vec!["careful".to_string()]);
        assert_eq!(out.metadata.computation_time_us, 42);
        assert_eq!(out.metadata.precision, "f64");
        assert_eq!(out.metadata.version, env!("CARGO_PKG_VERSION"));
    }
}
