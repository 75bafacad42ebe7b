use std::collections::{BTreeSet, HashSet};

use tracing::info;

use common::config::{PartitionRule, UniverseConfig};
use common::{Error, InstrumentGroup, Result};

/// The tradable universe after filtering: sorted and de-duplicated.
///
/// `include` is a whitelist and takes priority; `exclude` only applies when
/// there is no whitelist.
pub fn resolve_universe(cfg: &UniverseConfig) -> Result<Vec<String>> {
    let mut symbols: BTreeSet<&str> = cfg
        .instruments
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();
    let before = symbols.len();

    if let Some(include) = &cfg.include {
        let include: HashSet<&str> = include.iter().map(String::as_str).collect();
        symbols.retain(|s| include.contains(s));
        info!(before, after = symbols.len(), "Applied instrument whitelist");
    } else if !cfg.exclude.is_empty() {
        let exclude: HashSet<&str> = cfg.exclude.iter().map(String::as_str).collect();
        symbols.retain(|s| !exclude.contains(s));
        info!(before, after = symbols.len(), "Applied instrument blacklist");
    }

    if symbols.is_empty() {
        return Err(Error::Config("no instruments left to trade".into()));
    }
    Ok(symbols.into_iter().map(str::to_string).collect())
}

/// Split `universe` into disjoint, covering groups. Group ids start at 1.
pub fn partition(universe: &[String], rule: &PartitionRule) -> Result<Vec<InstrumentGroup>> {
    if universe.is_empty() {
        return Err(Error::Config("cannot partition an empty universe".into()));
    }

    let mut sorted = universe.to_vec();
    sorted.sort();
    sorted.dedup();

    let lists: Vec<Vec<String>> = match rule {
        PartitionRule::Processes(0) | PartitionRule::GroupSize(0) => {
            return Err(Error::Config("partition size must be at least 1".into()));
        }
        PartitionRule::Processes(n) => {
            let n = (*n).min(sorted.len());
            (0..n)
                .map(|k| sorted.iter().skip(k).step_by(n).cloned().collect())
                .collect()
        }
        PartitionRule::GroupSize(size) => sorted.chunks(*size).map(<[String]>::to_vec).collect(),
        PartitionRule::Explicit(lists) => {
            validate_explicit(&sorted, lists)?;
            lists.clone()
        }
    };

    Ok(lists
        .into_iter()
        .enumerate()
        .map(|(i, instruments)| InstrumentGroup::new(i + 1, instruments))
        .collect())
}

fn validate_explicit(universe: &[String], lists: &[Vec<String>]) -> Result<()> {
    let known: HashSet<&str> = universe.iter().map(String::as_str).collect();
    let mut seen: HashSet<&str> = HashSet::new();

    for (i, list) in lists.iter().enumerate() {
        if list.is_empty() {
            return Err(Error::Config(format!("explicit group {} is empty", i + 1)));
        }
        for symbol in list {
            if !known.contains(symbol.as_str()) {
                return Err(Error::Config(format!(
                    "explicit group {} lists {symbol}, which is not in the universe",
                    i + 1
                )));
            }
            if !seen.insert(symbol) {
                return Err(Error::Config(format!(
                    "{symbol} is assigned to more than one group"
                )));
            }
        }
    }

    let missing: Vec<&str> = universe
        .iter()
        .map(String::as_str)
        .filter(|s| !seen.contains(s))
        .collect();
    if !missing.is_empty() {
        return Err(Error::Config(format!(
            "explicit groups do not cover: {}",
            missing.join(", ")
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symbols(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn universe(instruments: &[&str]) -> UniverseConfig {
        UniverseConfig {
            instruments: symbols(instruments),
            ..UniverseConfig::default()
        }
    }

    #[test]
    fn universe_is_sorted_and_deduplicated() {
        let u = resolve_universe(&universe(&["MSFT", "AAPL", "MSFT", " "])).unwrap();
        assert_eq!(u, symbols(&["AAPL", "MSFT"]));
    }

    #[test]
    fn whitelist_wins_over_blacklist() {
        let cfg = UniverseConfig {
            instruments: symbols(&["A", "B", "C"]),
            include: Some(symbols(&["B", "C", "Z"])),
            exclude: symbols(&["C"]),
        };
        assert_eq!(resolve_universe(&cfg).unwrap(), symbols(&["B", "C"]));
    }

    #[test]
    fn blacklist_removes_symbols() {
        let cfg = UniverseConfig {
            exclude: symbols(&["B"]),
            ..universe(&["A", "B", "C"])
        };
        assert_eq!(resolve_universe(&cfg).unwrap(), symbols(&["A", "C"]));
    }

    #[test]
    fn empty_universe_is_an_error() {
        let cfg = UniverseConfig {
            exclude: symbols(&["A"]),
            ..universe(&["A"])
        };
        assert!(matches!(resolve_universe(&cfg), Err(Error::Config(_))));
        assert!(partition(&[], &PartitionRule::Processes(2)).is_err());
    }

    #[test]
    fn processes_deal_round_robin() {
        let u = symbols(&["A", "B", "C", "D", "E"]);
        let groups = partition(&u, &PartitionRule::Processes(2)).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].id, 1);
        assert_eq!(groups[0].instruments, symbols(&["A", "C", "E"]));
        assert_eq!(groups[1].instruments, symbols(&["B", "D"]));
    }

    #[test]
    fn processes_are_capped_at_universe_size() {
        let u = symbols(&["A", "B"]);
        let groups = partition(&u, &PartitionRule::Processes(8)).unwrap();
        assert_eq!(groups.len(), 2);
        assert!(groups.iter().all(|g| g.len() == 1));
    }

    #[test]
    fn group_size_chunks_consecutively() {
        let u = symbols(&["A", "B", "C", "D", "E"]);
        let groups = partition(&u, &PartitionRule::GroupSize(2)).unwrap();
        let lists: Vec<_> = groups.into_iter().map(|g| g.instruments).collect();
        assert_eq!(
            lists,
            vec![symbols(&["A", "B"]), symbols(&["C", "D"]), symbols(&["E"])]
        );
    }

    #[test]
    fn explicit_groups_must_be_disjoint_and_covering() {
        let u = symbols(&["A", "B", "C"]);
        let ok = PartitionRule::Explicit(vec![symbols(&["C", "A"]), symbols(&["B"])]);
        let groups = partition(&u, &ok).unwrap();
        assert_eq!(groups[0].instruments, symbols(&["C", "A"]));

        let overlap = PartitionRule::Explicit(vec![symbols(&["A", "B"]), symbols(&["B", "C"])]);
        assert!(partition(&u, &overlap).is_err());

        let gap = PartitionRule::Explicit(vec![symbols(&["A", "B"])]);
        assert!(partition(&u, &gap).unwrap_err().to_string().contains("C"));

        let unknown = PartitionRule::Explicit(vec![symbols(&["A", "B", "C", "Z"])]);
        assert!(partition(&u, &unknown).is_err());
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let u = symbols(&["A"]);
        assert!(partition(&u, &PartitionRule::Processes(0)).is_err());
        assert!(partition(&u, &PartitionRule::GroupSize(0)).is_err());
    }
}
