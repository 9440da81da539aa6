use std::collections::HashMap;

use chrono::{Datelike, NaiveDate};
use serde::{Serialize, Serializer};

use super::error::ModelError;
use super::graph::{ComputationGraph, Value};
use super::grant::Grant;
use super::income::{REM_GRANTS, RSU_WITHHOLDING_RATE};
use super::scenario::{PRICE_USD, QUERY_DATE};
use super::types::{Shares, Vehicle};

pub const GRANTS: &str = "grants";
pub const END_OF_YEAR: &str = "end_of_year";
pub const MAX_SELLABLE_RESTRICTED_FRAC: &str = "max_sellable_restricted_frac";
pub const SHARES_SELLABLE_N: &str = "shares_sellable_n";
pub const SHARES_SELLABLE_RESTRICTED_N: &str = "shares_sellable_restricted_n";
pub const SHARES_VESTED_RSU_USD: &str = "shares_vested_rsu_usd";

// Summation templates: `{}` becomes `_<vehicle>` or nothing for the total.
pub const SHARES_TOTAL: &str = "shares_total{}_n";
pub const SHARES_EXERCISED: &str = "shares_exercised{}_n";
pub const SHARES_VESTED: &str = "shares_vested{}_n";
pub const SHARES_VESTED_EOY: &str = "shares_vested{}_eoy_n";
pub const SHARES_UNVESTED: &str = "shares_unvested{}_n";
pub const SHARES_VESTED_UNSOLD: &str = "shares_vested_unsold{}_n";
pub const SHARES_VESTED_OUTSTANDING: &str = "shares_vested_outstanding{}_n";
pub const SHARES_OUTSTANDING: &str = "shares_outstanding{}_n";
pub const SHARES_HELD: &str = "shares_held{}_n";
pub const SHARES_PREVIOUSLY_SOLD: &str = "shares_previously_sold{}_n";
pub const EXERCISE_COST_OUTSTANDING: &str = "exercise_cost_outstanding{}_usd";
pub const EXERCISE_COST_VESTED_OUTSTANDING: &str = "exercise_cost_vested_outstanding{}_usd";

/// Name of a summation node: per vehicle or portfolio-wide, live or
/// post-sale (`rem_` prefix).
pub fn summation_name(template: &str, vehicle: Option<Vehicle>, remaining: bool) -> String {
    let suffix = vehicle.map(|v| format!("_{v}")).unwrap_or_default();
    let name = template.replace("{}", &suffix);
    if remaining { format!("rem_{name}") } else { name }
}

/// Grants in insertion order plus a by-name index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Position {
    grants: Vec<Grant>,
    index: HashMap<String, usize>,
}

impl Position {
    pub fn new(grants: Vec<Grant>) -> Result<Self, ModelError> {
        let mut index = HashMap::with_capacity(grants.len());
        for (i, grant) in grants.iter().enumerate() {
            if index.insert(grant.name().to_string(), i).is_some() {
                return Err(ModelError::config(format!(
                    "duplicate grant name {}",
                    grant.name()
                )));
            }
        }
        Ok(Self { grants, index })
    }

    pub fn grants(&self) -> &[Grant] {
        &self.grants
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Grant> {
        self.grants.iter()
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Grant> {
        self.index.get(name).map(|&i| &self.grants[i])
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut Grant> {
        let i = *self.index.get(name)?;
        self.grants.get_mut(i)
    }

    pub(crate) fn grants_mut(&mut self) -> std::slice::IterMut<'_, Grant> {
        self.grants.iter_mut()
    }

    fn of_vehicle(&self, vehicle: Vehicle) -> impl Iterator<Item = &Grant> {
        self.grants.iter().filter(move |g| g.vehicle() == vehicle)
    }
}

impl Serialize for Position {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(&self.grants)
    }
}

#[derive(Clone, Copy)]
enum AsOf {
    QueryDate,
    EndOfYear,
}

impl AsOf {
    fn node(self) -> &'static str {
        match self {
            AsOf::QueryDate => QUERY_DATE,
            AsOf::EndOfYear => END_OF_YEAR,
        }
    }
}

#[derive(Clone, Copy)]
enum Summand {
    Shares(fn(&Grant, NaiveDate) -> Result<Shares, ModelError>),
    Usd(fn(&Grant, NaiveDate) -> Result<f64, ModelError>),
}

#[derive(Clone, Copy)]
struct Summation {
    template: &'static str,
    as_of: AsOf,
    summand: Summand,
}

const SUMMATIONS: &[Summation] = &[
    Summation {
        template: SHARES_TOTAL,
        as_of: AsOf::QueryDate,
        summand: Summand::Shares(|g, _| Ok(g.total())),
    },
    Summation {
        template: SHARES_EXERCISED,
        as_of: AsOf::QueryDate,
        summand: Summand::Shares(|g, _| Ok(g.exercised())),
    },
    Summation {
        template: SHARES_VESTED,
        as_of: AsOf::QueryDate,
        summand: Summand::Shares(Grant::vested),
    },
    Summation {
        template: SHARES_VESTED_EOY,
        as_of: AsOf::EndOfYear,
        summand: Summand::Shares(Grant::vested),
    },
    Summation {
        template: SHARES_UNVESTED,
        as_of: AsOf::QueryDate,
        summand: Summand::Shares(Grant::unvested),
    },
    Summation {
        template: SHARES_VESTED_UNSOLD,
        as_of: AsOf::QueryDate,
        summand: Summand::Shares(Grant::vested_unsold),
    },
    Summation {
        template: SHARES_VESTED_OUTSTANDING,
        as_of: AsOf::QueryDate,
        summand: Summand::Shares(Grant::vested_outstanding),
    },
    Summation {
        template: SHARES_OUTSTANDING,
        as_of: AsOf::QueryDate,
        summand: Summand::Shares(|g, _| Ok(g.outstanding())),
    },
    Summation {
        template: SHARES_HELD,
        as_of: AsOf::QueryDate,
        summand: Summand::Shares(|g, _| Ok(g.held())),
    },
    Summation {
        template: SHARES_PREVIOUSLY_SOLD,
        as_of: AsOf::QueryDate,
        summand: Summand::Shares(|g, _| Ok(g.sold())),
    },
    Summation {
        template: EXERCISE_COST_OUTSTANDING,
        as_of: AsOf::QueryDate,
        summand: Summand::Usd(|g, _| Ok(g.outstanding_cost())),
    },
    Summation {
        template: EXERCISE_COST_VESTED_OUTSTANDING,
        as_of: AsOf::QueryDate,
        summand: Summand::Usd(Grant::vested_outstanding_cost),
    },
];

impl Summation {
    fn over(
        self,
        graph: &ComputationGraph,
        source: &str,
        vehicle: Vehicle,
    ) -> Result<Value, ModelError> {
        let position = graph.position(source)?;
        let on = graph.date(self.as_of.node())?;
        let grants = position.of_vehicle(vehicle);
        match self.summand {
            Summand::Shares(f) => grants
                .map(|g| f(g, on))
                .sum::<Result<Shares, _>>()
                .map(Value::Shares),
            Summand::Usd(f) => grants
                .map(|g| f(g, on))
                .sum::<Result<f64, _>>()
                .map(Value::Number),
        }
    }

    fn is_usd(self) -> bool {
        matches!(self.summand, Summand::Usd(_))
    }
}

fn total_of(graph: &ComputationGraph, parts: &[String], usd: bool) -> Result<Value, ModelError> {
    if usd {
        let mut total = 0.0;
        for part in parts {
            total += graph.number(part)?;
        }
        Ok(Value::Number(total))
    } else {
        let mut total: Shares = 0;
        for part in parts {
            total += graph.shares(part)?;
        }
        Ok(Value::Shares(total))
    }
}

fn shares_sellable_restricted(graph: &ComputationGraph) -> Result<Value, ModelError> {
    let name = |template, vehicle| summation_name(template, Some(vehicle), false);
    let mut considered: Shares = 0;
    let mut available: Shares = 0;
    for vehicle in [Vehicle::Nso, Vehicle::Iso] {
        considered += graph.shares(&name(SHARES_TOTAL, vehicle))?
            - graph.shares(&name(SHARES_PREVIOUSLY_SOLD, vehicle))?;
        available += graph.shares(&name(SHARES_VESTED_OUTSTANDING, vehicle))?;
    }
    let fraction = graph.number(MAX_SELLABLE_RESTRICTED_FRAC)?;
    let cap = (considered as f64 * fraction).floor() as Shares;
    Ok(Value::Shares(available.min(cap)))
}

fn shares_sellable(graph: &ComputationGraph) -> Result<Value, ModelError> {
    let position = graph.position(GRANTS)?;
    let on = graph.date(QUERY_DATE)?;
    let rate = graph.number(RSU_WITHHOLDING_RATE)?;
    let mut rsu: Shares = 0;
    for grant in position.of_vehicle(Vehicle::Rsu) {
        rsu += grant.available(on, rate)?.max(0);
    }
    Ok(Value::Shares(graph.shares(SHARES_SELLABLE_RESTRICTED_N)? + rsu))
}

/// Registers the position's summation and liquidity nodes.
pub fn register(graph: &mut ComputationGraph) {
    for &summation in SUMMATIONS {
        for remaining in [false, true] {
            let source = if remaining { REM_GRANTS } else { GRANTS };
            let mut parts = Vec::with_capacity(Vehicle::ALL.len());
            for vehicle in Vehicle::ALL {
                let name = summation_name(summation.template, Some(vehicle), remaining);
                parts.push(name.clone());
                graph.register_fn(name, move |g| summation.over(g, source, vehicle));
            }
            let usd = summation.is_usd();
            graph.register_fn(
                summation_name(summation.template, None, remaining),
                move |g| total_of(g, &parts, usd),
            );
        }
    }

    graph.register_fn(END_OF_YEAR, |g| {
        let on = g.date(QUERY_DATE)?;
        NaiveDate::from_ymd_opt(on.year(), 12, 31)
            .map(Value::Date)
            .ok_or_else(|| ModelError::InvalidDate(on.to_string()))
    });
    graph.register_fn(SHARES_VESTED_RSU_USD, |g| {
        let vested = g.shares(&summation_name(SHARES_VESTED, Some(Vehicle::Rsu), false))?;
        Ok(Value::Number(vested as f64 * g.number(PRICE_USD)?))
    });
    graph.register_fn(SHARES_SELLABLE_RESTRICTED_N, shares_sellable_restricted);
    graph.register_fn(SHARES_SELLABLE_N, shares_sellable);
}
