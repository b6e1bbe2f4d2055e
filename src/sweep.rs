//! Expansion of the `[experiment]` table into concrete runs.
//!
//! Every axis is a list; a run is one pick from each. The algorithm axis is
//! special: a table entry such as `{ name = "copa", delta = [0.1, 0.5] }`
//! expands into one algorithm per combination of its list-valued keys, and
//! those multiply into the product like any other axis.

use std::collections::BTreeMap;
use std::fmt;

use emulation::BufferDepth;
use rand::seq::SliceRandom;
use serde::{Deserialize, Deserializer};
use toml::{Table, Value};

use crate::error::ExpError;
use crate::traffic::TrafficSpec;

pub const ALG_AXIS: &str = "alg";
pub const SCH_AXIS: &str = "sch";
pub const BUNDLE_AXIS: &str = "bundle_traffic";
pub const CROSS_AXIS: &str = "cross_traffic";

/// Schedulers a run without the bundler may use.
pub const NO_BUNDLER_SCHEDULERS: [&str; 2] = ["fifo", "sfq"];

/// Values listed for `axis`; empty if the axis is missing.
pub fn axis_values<'a>(
    experiment: &'a Table,
    axis: &str,
) -> impl Iterator<Item = &'a Value> + use<'a> {
    experiment
        .get(axis)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

/// Cartesian product of named lists, in axis order.
fn cartesian(axes: &[(&str, &[Value])]) -> Vec<Table> {
    let mut out = vec![Table::new()];
    for (name, values) in axes {
        out = out
            .iter()
            .flat_map(|partial| {
                values.iter().map(move |value| {
                    let mut next = partial.clone();
                    next.insert((*name).to_string(), value.clone());
                    next
                })
            })
            .collect();
    }
    out
}

/// Expand one algorithm entry into its variants.
fn alg_variants(alg: &Value) -> Vec<Value> {
    let Some(table) = alg.as_table() else {
        return vec![alg.clone()];
    };
    let (lists, fixed): (Vec<_>, Vec<_>) = table.iter().partition(|(_, v)| v.is_array());
    let axes: Vec<(&str, &[Value])> = lists
        .iter()
        .filter_map(|(k, v)| v.as_array().map(|a| (k.as_str(), a.as_slice())))
        .collect();

    cartesian(&axes)
        .into_iter()
        .map(|mut variant| {
            for (k, v) in &fixed {
                variant.insert((*k).clone(), (*v).clone());
            }
            Value::Table(variant)
        })
        .collect()
}

/// Every combination of axis values, with algorithm variants flattened in.
pub fn expand(experiment: &Table) -> Vec<Table> {
    let axes: Vec<(&str, &[Value])> = experiment
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_array().map(Vec::as_slice).unwrap_or(&[])))
        .collect();

    cartesian(&axes)
        .into_iter()
        .flat_map(|combo| {
            let variants = combo
                .get(ALG_AXIS)
                .map(alg_variants)
                .unwrap_or_else(|| vec![Value::Table(Table::new())]);
            let has_alg = combo.contains_key(ALG_AXIS);
            variants.into_iter().map(move |alg| {
                let mut combo = combo.clone();
                if has_alg {
                    combo.insert(ALG_AXIS.to_string(), alg);
                }
                combo
            })
        })
        .collect()
}

/// All runs, in declaration order.
pub fn enumerate(experiment: &Table) -> Result<Vec<Experiment>, ExpError> {
    expand(experiment)
        .into_iter()
        .map(|combo| {
            Value::Table(combo.clone())
                .try_into::<Experiment>()
                .map_err(|e| {
                    ExpError::config(format!("experiment combination {combo} is invalid: {e}"))
                })
        })
        .collect()
}

/// All runs, in random order.
pub fn plan(experiment: &Table) -> Result<Vec<Experiment>, ExpError> {
    let mut runs = enumerate(experiment)?;
    runs.shuffle(&mut rand::rng());
    Ok(runs)
}

/// One concrete run.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Experiment {
    pub sch: String,
    pub alg: Algorithm,
    /// Link rate in Mbit/s.
    pub rate: u32,
    /// Round trip time in ms.
    pub rtt: u32,
    /// Queue size in bandwidth-delay products.
    pub bdp: BufferDepth,
    pub seed: u64,
    pub bundle_traffic: Vec<TrafficSpec>,
    #[serde(default)]
    pub cross_traffic: Vec<TrafficSpec>,
}

impl Experiment {
    pub fn uses_bundler(&self) -> bool {
        !self.alg.is_no_bundler()
    }

    /// Runs without the bundler only make sense with a plain or fair queue.
    pub fn skipped(&self) -> bool {
        self.alg.is_no_bundler() && !NO_BUNDLER_SCHEDULERS.contains(&self.sch.as_str())
    }

    /// Directory of this run relative to the experiment directory.
    pub fn iteration_name(&self, bundle: &str, cross: &str) -> String {
        format!(
            "{}_{}_{}_{}/b={bundle}_c={cross}/{}",
            self.sch, self.alg, self.rate, self.rtt, self.seed
        )
    }
}

impl fmt::Display for Experiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sch={} alg={} rate={} rtt={} bdp={} seed={}",
            self.sch, self.alg, self.rate, self.rtt, self.bdp, self.seed
        )
    }
}

/// A congestion control algorithm and its parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Algorithm {
    pub name: String,
    pub params: BTreeMap<String, Value>,
}

impl Algorithm {
    /// Pseudo-algorithm for runs without inbox, agent and outbox.
    pub const NO_BUNDLER: &'static str = "nobundler";

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: BTreeMap::new(),
        }
    }

    /// Name of an algorithm axis entry, before variant expansion.
    pub fn name_of(value: &Value) -> Option<&str> {
        match value {
            Value::String(s) => Some(s),
            Value::Table(t) => t.get("name").and_then(Value::as_str),
            _ => None,
        }
    }

    pub fn is_no_bundler(&self) -> bool {
        self.name == Self::NO_BUNDLER
    }
}

impl<'de> Deserialize<'de> for Algorithm {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        match Value::deserialize(deserializer)? {
            Value::String(name) => Ok(Algorithm::named(name)),
            Value::Table(mut table) => {
                let name = match table.remove("name") {
                    Some(Value::String(name)) => name,
                    _ => return Err(D::Error::custom("algorithm table needs a string 'name'")),
                };
                Ok(Algorithm {
                    name,
                    params: table.into_iter().collect(),
                })
            }
            other => Err(D::Error::custom(format!(
                "algorithm must be a name or a table, not {}",
                other.type_str()
            ))),
        }
    }
}

/// `name` or `name.k=v.k=v`.
impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for (k, v) in &self.params {
            match v {
                Value::String(s) => write!(f, ".{k}={s}")?,
                other => write!(f, ".{k}={other}")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(src: &str) -> Table {
        src.parse().unwrap()
    }

    #[test]
    fn algorithm_variants_multiply_into_the_product() {
        let exp = table(
            r#"
            sch = ["a", "b"]
            alg = [{ name = "x", variants = [1, 2] }]
            "#,
        );
        assert_eq!(expand(&exp).len(), 4);
    }

    #[test]
    fn plain_axes_form_a_cartesian_product() {
        let exp = table(
            r#"
            sch = ["fifo", "sfq", "fqcodel"]
            rate = [24, 96]
            alg = ["copa", "nimbus"]
            "#,
        );
        let combos = expand(&exp);
        assert_eq!(combos.len(), 12);
        let mut seen: Vec<String> = combos.iter().map(|c| c.to_string()).collect();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 12);
    }

    #[test]
    fn variant_keys_expand_independently_and_keep_fixed_keys() {
        let alg: Value = toml::from_str::<Table>(
            r#"a = { name = "copa", delta = [0.1, 0.5], mode = ["x", "y", "z"], k = 3 }"#,
        )
        .unwrap()
        .remove("a")
        .unwrap();
        let variants = alg_variants(&alg);
        assert_eq!(variants.len(), 6);
        for v in &variants {
            let t = v.as_table().unwrap();
            assert_eq!(t["name"].as_str(), Some("copa"));
            assert_eq!(t["k"].as_integer(), Some(3));
            assert!(t["delta"].is_float());
        }
    }

    #[test]
    fn empty_axis_yields_nothing() {
        let exp = table("sch = []\nrate = [1, 2]\n");
        assert!(expand(&exp).is_empty());
    }

    #[test]
    fn algorithm_display_encodes_params() {
        let alg: Algorithm = Value::Table(table(
            r#"name = "copa"
            delta = 0.5
            mode = "auto""#,
        ))
        .try_into()
        .unwrap();
        assert_eq!(alg.to_string(), "copa.delta=0.5.mode=auto");
        assert_eq!(Algorithm::named("nimbus").to_string(), "nimbus");
    }

    #[test]
    fn algorithm_requires_a_name() {
        let res: Result<Algorithm, _> = Value::Table(table("delta = 1")).try_into();
        assert!(res.is_err());
        assert_eq!(Algorithm::name_of(&Value::Integer(3)), None);
    }

    #[test]
    fn nobundler_only_runs_with_fifo_or_sfq() {
        let mut exp = Experiment {
            sch: "fqcodel".into(),
            alg: Algorithm::named(Algorithm::NO_BUNDLER),
            rate: 96,
            rtt: 50,
            bdp: BufferDepth::Bdp(2),
            seed: 1,
            bundle_traffic: vec![],
            cross_traffic: vec![],
        };
        assert!(exp.skipped());
        exp.sch = "sfq".into();
        assert!(!exp.skipped());
        exp.sch = "fqcodel".into();
        exp.alg = Algorithm::named("copa");
        assert!(!exp.skipped());
    }

    #[test]
    fn iteration_name_layout() {
        let exp = Experiment {
            sch: "sfq".into(),
            alg: Algorithm::named("copa"),
            rate: 96,
            rtt: 50,
            bdp: BufferDepth::Unbounded,
            seed: 42,
            bundle_traffic: vec![],
            cross_traffic: vec![],
        };
        assert_eq!(
            exp.iteration_name("iperf.cubic.4", "cbr.12"),
            "sfq_copa_96_50/b=iperf.cubic.4_c=cbr.12/42"
        );
    }
}
