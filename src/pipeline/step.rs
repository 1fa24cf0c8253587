//! Pipeline steps and weighted branch resolution.

use rand::Rng;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::types::{Digest, Error, Result};

/// One step of a pipeline version.
///
/// Serialises as a bare digest string or as `{"SPLIT": {"<digest>": <weight>, ...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Step {
    Digest(Digest),
    Split(SplitStep),
}

impl Step {
    pub fn digest(digest: Digest) -> Self {
        Step::Digest(digest)
    }

    pub fn split(branches: impl IntoIterator<Item = (Digest, f64)>) -> Self {
        Step::Split(SplitStep::new(branches))
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Step::Digest(_) => Ok(()),
            Step::Split(split) => split.validate(),
        }
    }

    /// Concrete digest for this step, or `None` when a split draw misses.
    pub fn resolve<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<Digest> {
        match self {
            Step::Digest(digest) => Some(digest.clone()),
            Step::Split(split) => split.pick(rng).cloned(),
        }
    }
}

impl From<Digest> for Step {
    fn from(digest: Digest) -> Self {
        Step::Digest(digest)
    }
}

/// Weighted random branch. Weights need not sum to 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitStep {
    /// Candidates in declaration order.
    #[serde(rename = "SPLIT", with = "ordered_weights")]
    pub branches: Vec<(Digest, f64)>,
}

impl SplitStep {
    pub fn new(branches: impl IntoIterator<Item = (Digest, f64)>) -> Self {
        Self {
            branches: branches.into_iter().collect(),
        }
    }

    pub fn total_weight(&self) -> f64 {
        self.branches.iter().map(|(_, w)| w).sum()
    }

    pub fn validate(&self) -> Result<()> {
        if self.branches.is_empty() {
            return Err(Error::validation("split step has no branches"));
        }
        for (digest, weight) in &self.branches {
            if !weight.is_finite() || *weight < 0.0 {
                return Err(Error::validation(format!(
                    "split weight for {} must be a finite non-negative number, got {}",
                    digest, weight
                )));
            }
        }
        Ok(())
    }

    /// Draw one sample in [0, 1) and walk the cumulative weights; the first
    /// branch whose running total passes the sample wins. Mass left over when
    /// the weights sum below 1 is a miss.
    pub fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&Digest> {
        let sample: f64 = rng.gen();
        let mut cumulative = 0.0;
        for (digest, weight) in &self.branches {
            cumulative += weight;
            if sample < cumulative {
                return Some(digest);
            }
        }
        None
    }
}

/// Resolve a version's steps into the digests to invoke, in order.
/// Split misses are filtered out.
pub fn resolve_steps<R: Rng + ?Sized>(steps: &[Step], rng: &mut R) -> Vec<Digest> {
    steps.iter().filter_map(|step| step.resolve(rng)).collect()
}

/// `Vec<(Digest, f64)>` as a JSON object, keeping key order on the way in.
mod ordered_weights {
    use super::*;

    pub fn serialize<S: Serializer>(branches: &[(Digest, f64)], s: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = s.serialize_map(Some(branches.len()))?;
        for (digest, weight) in branches {
            map.serialize_entry(digest, weight)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<(Digest, f64)>, D::Error> {
        struct WeightsVisitor;

        impl<'de> Visitor<'de> for WeightsVisitor {
            type Value = Vec<(Digest, f64)>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of digest to weight")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Self::Value, A::Error> {
                let mut branches = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((digest, weight)) = access.next_entry::<Digest, f64>()? {
                    branches.push((digest, weight));
                }
                Ok(branches)
            }
        }

        d.deserialize_map(WeightsVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    fn digest(s: &str) -> Digest {
        Digest::from_string(s).unwrap()
    }

    #[test]
    fn test_parse_mixed_steps() {
        let steps: Vec<Step> =
            serde_json::from_value(json!(["d1", {"SPLIT": {"b": 0.7, "a": 0.3}}])).unwrap();
        assert_eq!(
            steps,
            vec![
                Step::digest(digest("d1")),
                Step::split([(digest("b"), 0.7), (digest("a"), 0.3)]),
            ]
        );
        assert_eq!(
            serde_json::to_value(&steps).unwrap(),
            json!(["d1", {"SPLIT": {"b": 0.7, "a": 0.3}}])
        );
    }

    #[test]
    fn test_validate_rejects_bad_weights() {
        assert!(SplitStep::new([]).validate().is_err());
        assert!(SplitStep::new([(digest("a"), -0.1)]).validate().is_err());
        assert!(SplitStep::new([(digest("a"), f64::NAN)]).validate().is_err());
        assert!(SplitStep::new([(digest("a"), 0.0), (digest("b"), 2.0)])
            .validate()
            .is_ok());
    }

    #[test]
    fn test_full_weight_always_hits() {
        let mut rng = StdRng::seed_from_u64(1);
        let split = SplitStep::new([(digest("a"), 1.0)]);
        for _ in 0..100 {
            assert_eq!(split.pick(&mut rng), Some(&digest("a")));
        }
    }

    #[test]
    fn test_zero_weight_never_hits() {
        let mut rng = StdRng::seed_from_u64(2);
        let split = SplitStep::new([(digest("a"), 0.0), (digest("b"), 1.0)]);
        for _ in 0..100 {
            assert_eq!(split.pick(&mut rng), Some(&digest("b")));
        }
    }

    #[test]
    fn test_under_sum_misses_are_filtered() {
        let mut rng = StdRng::seed_from_u64(3);
        let steps = vec![
            Step::digest(digest("first")),
            Step::split([(digest("rare"), 0.0)]),
            Step::digest(digest("last")),
        ];
        assert_eq!(resolve_steps(&steps, &mut rng), vec![digest("first"), digest("last")]);
    }

    #[test]
    fn test_split_ratio_tracks_weights() {
        let mut rng = StdRng::seed_from_u64(42);
        let split = SplitStep::new([(digest("A"), 0.3), (digest("B"), 0.7)]);
        let draws = 500;
        let a = (0..draws)
            .filter(|_| split.pick(&mut rng) == Some(&digest("A")))
            .count();
        let ratio = a as f64 / draws as f64;
        assert!((ratio - 0.3).abs() <= 0.07, "ratio {}", ratio);
    }
}
