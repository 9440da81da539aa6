//! Sale simulation, automatic RSU withholding and the income nodes.

use std::rc::Rc;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, info};

use super::error::ModelError;
use super::graph::{ComputationGraph, Value};
use super::grant::SaleOutcome;
use super::position::{GRANTS, Position};
use super::scenario::{PRICE_USD, QUERY_DATE, REG_INCOME_USD};
use super::taxes::MEDICARE_TAX_TABLE;
use super::types::{PerVehicle, SaleOrder, Shares, Vehicle};

pub const SALES_ORDERS: &str = "sales_orders";
pub const SALES_SIMULATION: &str = "sales_simulation";
pub const REM_GRANTS: &str = "rem_grants";

pub const RSU_FED_HOLD_RATE: &str = "rsu_fed_hold_rate";
pub const RSU_STATE_HOLD_RATE: &str = "rsu_state_hold_rate";
pub const RSU_WITHHOLDING_RATE: &str = "rsu_withholding_rate";
pub const NSO_WITHHOLDING_RATE: &str = "nso_withholding_rate";
pub const ISO_WITHHOLDING_RATE: &str = "iso_withholding_rate";

pub const SHARES_WITHHELD_RSU_N: &str = "shares_withheld_rsu_n";
pub const SHARES_WITHHELD_RSU_USD: &str = "shares_withheld_rsu_usd";
pub const SHARES_WITHHELD_RSU_FED_USD: &str = "shares_withheld_rsu_fed_usd";
pub const SHARES_WITHHELD_RSU_STATE_USD: &str = "shares_withheld_rsu_state_usd";

pub const ISO_EXERCISE_INCOME_USD: &str = "iso_exercise_income_usd";
pub const RSU_INCOME_USD: &str = "rsu_income_usd";
pub const NSO_INCOME_USD: &str = "nso_income_usd";
pub const ISO_SALES_INCOME_USD: &str = "iso_sales_income_usd";
pub const EXERCISE_COST_USD: &str = "exercise_cost_usd";
pub const SALE_GROSS_USD: &str = "sale_gross_usd";
pub const SALE_PROCEEDS_USD: &str = "sale_proceeds_usd";
pub const TOTAL_INCOME_USD: &str = "total_income_usd";

/// One applied sale order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Fill {
    pub grant: String,
    pub vehicle: Vehicle,
    pub quantity: Shares,
    pub price_usd: f64,
    #[serde(flatten)]
    pub outcome: SaleOutcome,
}

/// Result of running the scenario's sale orders against a copy of the
/// live position.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleSimulation {
    /// Net proceeds (gross minus exercise cost) per vehicle.
    pub income_usd: PerVehicle<f64>,
    pub gross_usd: f64,
    pub cost_usd: f64,
    /// Sell-to-cover shares recorded per vehicle.
    pub withheld: PerVehicle<Shares>,
    pub fills: Vec<Fill>,
    /// Post-sale cap table.
    pub end: Position,
}

impl SaleSimulation {
    pub fn proceeds_usd(&self) -> f64 {
        self.income_usd.rsu + self.income_usd.nso + self.income_usd.iso
    }
}

/// Applies withholding to every grant, then each order in sequence, on a
/// working copy of `live`. `live` itself is never touched.
pub fn simulate_sales(
    live: &Position,
    orders: &[SaleOrder],
    on: NaiveDate,
    rates: &PerVehicle<f64>,
) -> Result<SaleSimulation, ModelError> {
    let mut end = live.clone();
    let mut withheld = PerVehicle::<Shares>::default();
    for grant in end.grants_mut() {
        let vehicle = grant.vehicle();
        *withheld.get_mut(vehicle) += grant.record_withholding(on, *rates.get(vehicle))?;
    }

    let mut income_usd = PerVehicle::<f64>::default();
    let mut gross_usd = 0.0;
    let mut cost_usd = 0.0;
    let mut fills = Vec::with_capacity(orders.len());
    for order in orders {
        let grant = end
            .get_mut(&order.grant)
            .ok_or_else(|| ModelError::UnknownGrant(order.grant.clone()))?;
        let vehicle = grant.vehicle();
        let outcome = grant.sell(
            on,
            order.quantity,
            order.price_usd,
            *rates.get(vehicle),
            order.prefer_exercise,
            true,
        )?;
        debug!(
            grant = %order.grant,
            quantity = order.quantity,
            net_usd = outcome.net_usd,
            "simulated sale"
        );
        *income_usd.get_mut(vehicle) += outcome.net_usd;
        gross_usd += outcome.gross_usd;
        cost_usd += outcome.cost_usd;
        fills.push(Fill {
            grant: order.grant.clone(),
            vehicle,
            quantity: order.quantity,
            price_usd: order.price_usd,
            outcome,
        });
    }

    Ok(SaleSimulation {
        income_usd,
        gross_usd,
        cost_usd,
        withheld,
        fills,
        end,
    })
}

/// Makes the simulated end state the live position and clears the orders.
pub fn commit_sales(graph: &mut ComputationGraph) -> Result<Rc<SaleSimulation>, ModelError> {
    let simulation = graph.simulation(SALES_SIMULATION)?;
    graph.register(GRANTS, simulation.end.clone());
    graph.register(SALES_ORDERS, Vec::<SaleOrder>::new());
    graph.revert(GRANTS)?;
    graph.revert(SALES_ORDERS)?;
    info!(
        fills = simulation.fills.len(),
        proceeds_usd = simulation.proceeds_usd(),
        "committed sales"
    );
    Ok(simulation)
}

fn withholding_rates(graph: &ComputationGraph) -> Result<PerVehicle<f64>, ModelError> {
    Ok(PerVehicle {
        rsu: graph.number(RSU_WITHHOLDING_RATE)?,
        nso: graph.number(NSO_WITHHOLDING_RATE)?,
        iso: graph.number(ISO_WITHHOLDING_RATE)?,
    })
}

fn top_medicare_rate(graph: &ComputationGraph) -> Result<f64, ModelError> {
    Ok(graph.table(MEDICARE_TAX_TABLE)?.max_rate())
}

fn simulated(
    graph: &ComputationGraph,
    pick: fn(&SaleSimulation) -> f64,
) -> Result<Value, ModelError> {
    let simulation = graph.simulation(SALES_SIMULATION)?;
    Ok(Value::Number(pick(&simulation)))
}

/// Portion of the RSU withholding value attributed to `component` rates.
fn withheld_share(graph: &ComputationGraph, component: f64) -> Result<Value, ModelError> {
    let rate = graph.number(RSU_WITHHOLDING_RATE)?;
    if rate <= 0.0 {
        return Ok(Value::Number(0.0));
    }
    Ok(Value::Number(
        graph.number(SHARES_WITHHELD_RSU_USD)? * component / rate,
    ))
}

/// Registers the sale simulation and the income and withholding nodes.
pub fn register(graph: &mut ComputationGraph) {
    // Assumes the social security and SDI wage caps were already hit, so
    // only the top Medicare rate is withheld on top of fed and state.
    graph.register_fn(RSU_WITHHOLDING_RATE, |g| {
        Ok(Value::Number(
            g.number(RSU_FED_HOLD_RATE)? + g.number(RSU_STATE_HOLD_RATE)? + top_medicare_rate(g)?,
        ))
    });

    graph.register_fn(SALES_SIMULATION, |g| {
        let live = g.position(GRANTS)?;
        let orders = g.orders(SALES_ORDERS)?;
        let simulation =
            simulate_sales(&live, &orders, g.date(QUERY_DATE)?, &withholding_rates(g)?)?;
        Ok(Value::from(simulation))
    });
    graph.register_fn(REM_GRANTS, |g| {
        Ok(Value::from(g.simulation(SALES_SIMULATION)?.end.clone()))
    });

    graph.register_fn(RSU_INCOME_USD, |g| simulated(g, |s| s.income_usd.rsu));
    graph.register_fn(NSO_INCOME_USD, |g| simulated(g, |s| s.income_usd.nso));
    graph.register_fn(ISO_SALES_INCOME_USD, |g| simulated(g, |s| s.income_usd.iso));
    graph.register_fn(EXERCISE_COST_USD, |g| simulated(g, |s| s.cost_usd));
    graph.register_fn(SALE_GROSS_USD, |g| simulated(g, |s| s.gross_usd));
    graph.register_fn(SALE_PROCEEDS_USD, |g| simulated(g, SaleSimulation::proceeds_usd));
    graph.register_fn(TOTAL_INCOME_USD, |g| {
        Ok(Value::Number(
            g.number(REG_INCOME_USD)?
                + g.number(RSU_INCOME_USD)?
                + g.number(NSO_INCOME_USD)?
                + g.number(ISO_SALES_INCOME_USD)?,
        ))
    });

    graph.register_fn(SHARES_WITHHELD_RSU_N, |g| {
        let on = g.date(QUERY_DATE)?;
        let rate = g.number(RSU_WITHHOLDING_RATE)?;
        let mut withheld: Shares = 0;
        for grant in g.position(GRANTS)?.iter().filter(|grant| grant.vehicle() == Vehicle::Rsu) {
            withheld += grant.withheld(on, rate)?;
        }
        Ok(Value::Shares(withheld))
    });
    graph.register_fn(SHARES_WITHHELD_RSU_USD, |g| {
        Ok(Value::Number(
            g.shares(SHARES_WITHHELD_RSU_N)? as f64 * g.number(PRICE_USD)?,
        ))
    });
    graph.register_fn(SHARES_WITHHELD_RSU_FED_USD, |g| {
        let component = g.number(RSU_FED_HOLD_RATE)? + top_medicare_rate(g)?;
        withheld_share(g, component)
    });
    graph.register_fn(SHARES_WITHHELD_RSU_STATE_USD, |g| {
        let component = g.number(RSU_STATE_HOLD_RATE)?;
        withheld_share(g, component)
    });
}
