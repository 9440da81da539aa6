//! Marginal-bracket tax tables and the federal/state tax nodes.

use serde::{Deserialize, Serialize};

use super::error::ModelError;
use super::graph::{ComputationGraph, Value};
use super::income::{
    ISO_EXERCISE_INCOME_USD, ISO_SALES_INCOME_USD, NSO_INCOME_USD, SALE_PROCEEDS_USD,
    SHARES_WITHHELD_RSU_FED_USD, SHARES_WITHHELD_RSU_STATE_USD,
};
use super::position::SHARES_VESTED_RSU_USD;
use super::scenario::{
    EXT_AMT_INCOME_USD, FED_WITHHELD_USD, PRETAX_401K_USD, PRETAX_DCRA_USD, PRETAX_FSA_USD,
    PRICE_USD, REG_INCOME_USD, STATE_WITHHELD_USD,
};
use super::solver::{SolveConfig, SolveResult, solve_for};
use super::types::Shares;

pub const FED_TAX_TABLE: &str = "fed_tax_table";
pub const STATE_TAX_TABLE: &str = "state_tax_table";
pub const AMT_TAX_TABLE: &str = "amt_tax_table";
pub const MEDICARE_TAX_TABLE: &str = "medicare_tax_table";
pub const SS_TAX_TABLE: &str = "ss_tax_table";
pub const SDI_TAX_TABLE: &str = "sdi_tax_table";

pub const FED_STD_DEDUCTION_USD: &str = "fed_std_deduction_usd";
pub const STATE_STD_DEDUCTION_USD: &str = "state_std_deduction_usd";
pub const FED_ITEMIZED_DEDUCTIONS_USD: &str = "fed_itemized_deductions_usd";
pub const STATE_ITEMIZED_DEDUCTIONS_USD: &str = "state_itemized_deductions_usd";
pub const AMT_EXEMPTION_BASE_USD: &str = "amt_exemption_base_usd";
pub const AMT_EXEMPTION_ROLLOFF_THRESHOLD_USD: &str = "amt_exemption_rolloff_threshold_usd";

pub const TAX_EXEMPT_CONTRIBUTIONS_USD: &str = "tax_exempt_contributions_usd";
pub const RSU_VESTING_TAXABLE_INCOME_USD: &str = "rsu_vesting_taxable_income_usd";

pub const FED_TAX_DEDUCTION_USD: &str = "fed_tax_deduction_usd";
pub const FED_TAXABLE_INCOME_USD: &str = "fed_taxable_income_usd";
pub const FED_REG_INCOME_TAXES_USD: &str = "fed_reg_income_taxes_usd";
pub const FED_MEDICARE_TAXES_USD: &str = "fed_medicare_taxes_usd";
pub const FED_SS_TAXES_USD: &str = "fed_ss_taxes_usd";
pub const FED_PAYROLL_TAXES_USD: &str = "fed_payroll_taxes_usd";
pub const FED_TAXES_USD: &str = "fed_taxes_usd";

pub const AMT_BASE_INCOME_USD: &str = "amt_base_income_usd";
pub const AMT_EXEMPTION_USD: &str = "amt_exemption_usd";
pub const AMT_TAXABLE_INCOME_USD: &str = "amt_taxable_income_usd";
pub const AMT_TAXES_USD: &str = "amt_taxes_usd";
pub const AMT_EXCESS_USD: &str = "amt_excess_usd";

pub const STATE_TAX_DEDUCTION_USD: &str = "state_tax_deduction_usd";
pub const STATE_TAXABLE_INCOME_USD: &str = "state_taxable_income_usd";
pub const STATE_REG_INCOME_TAXES_USD: &str = "state_reg_income_taxes_usd";
pub const STATE_SDI_TAXES_USD: &str = "state_sdi_taxes_usd";
pub const STATE_TAXES_USD: &str = "state_taxes_usd";

pub const TAX_BURDEN_USD: &str = "tax_burden_usd";
pub const FED_TAX_OUTSTANDING_USD: &str = "fed_tax_outstanding_usd";
pub const STATE_TAX_OUTSTANDING_USD: &str = "state_tax_outstanding_usd";
pub const TAX_OUTSTANDING_USD: &str = "tax_outstanding_usd";
pub const CASH_AFTER_TAXES_USD: &str = "cash_after_taxes_usd";
pub const RSU_SHARES_TO_COVER_N: &str = "rsu_shares_to_cover_n";

/// Share of income above the rolloff threshold that erodes the AMT exemption.
const AMT_EXEMPTION_PHASE_OUT_RATE: f64 = 0.25;

/// Marginal brackets: `(floor, rate)` pairs sorted by floor.
///
/// Serialized as a list of pairs, e.g. `[[0, 0.1], [19750, 0.12]]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<(f64, f64)>", into = "Vec<(f64, f64)>")]
pub struct TaxTable {
    brackets: Vec<(f64, f64)>,
}

impl TryFrom<Vec<(f64, f64)>> for TaxTable {
    type Error = ModelError;

    fn try_from(brackets: Vec<(f64, f64)>) -> Result<Self, Self::Error> {
        TaxTable::new(brackets)
    }
}

impl From<TaxTable> for Vec<(f64, f64)> {
    fn from(table: TaxTable) -> Self {
        table.brackets
    }
}

impl TaxTable {
    pub fn new(brackets: impl IntoIterator<Item = (f64, f64)>) -> Result<Self, ModelError> {
        let mut brackets: Vec<(f64, f64)> = brackets.into_iter().collect();
        if brackets.is_empty() {
            return Err(ModelError::config("tax table needs at least one bracket"));
        }
        for &(floor, rate) in &brackets {
            if !floor.is_finite() || floor < 0.0 {
                return Err(ModelError::config(format!(
                    "tax bracket floor {floor} must be a non-negative amount"
                )));
            }
            if !rate.is_finite() || !(0.0..=1.0).contains(&rate) {
                return Err(ModelError::config(format!(
                    "tax rate {rate} must be between 0 and 1"
                )));
            }
        }
        brackets.sort_by(|a, b| a.0.total_cmp(&b.0));
        if brackets.windows(2).any(|pair| pair[0].0 == pair[1].0) {
            return Err(ModelError::config("tax table has duplicate bracket floors"));
        }
        Ok(Self { brackets })
    }

    fn from_sorted(brackets: &[(f64, f64)]) -> Self {
        Self {
            brackets: brackets.to_vec(),
        }
    }

    pub fn brackets(&self) -> &[(f64, f64)] {
        &self.brackets
    }

    /// Highest marginal rate in the table.
    pub fn max_rate(&self) -> f64 {
        self.brackets
            .iter()
            .map(|&(_, rate)| rate)
            .fold(0.0, f64::max)
    }

    /// Tax owed on `value`, rounded to cents.
    pub fn apply(&self, value: f64) -> f64 {
        let mut tax = 0.0;
        for (idx, &(floor, rate)) in self.brackets.iter().enumerate() {
            let taxable = match self.brackets.get(idx + 1) {
                Some(&(next, _)) => value.min(next) - floor,
                None => value - floor,
            };
            if taxable <= 0.0 {
                break;
            }
            tax += taxable * rate;
        }
        (tax * 100.0).round_ties_even() / 100.0
    }

    /// 2020 federal brackets, married filing jointly.
    pub fn federal_mfj_2020() -> Self {
        Self::from_sorted(&[
            (0.0, 0.10),
            (19_750.0, 0.12),
            (80_250.0, 0.22),
            (171_050.0, 0.24),
            (326_600.0, 0.32),
            (414_700.0, 0.35),
            (622_050.0, 0.37),
        ])
    }

    /// 2020 California brackets, married filing jointly.
    pub fn california_mfj_2020() -> Self {
        Self::from_sorted(&[
            (0.0, 0.01),
            (17_618.0, 0.02),
            (41_766.0, 0.04),
            (65_920.0, 0.06),
            (91_506.0, 0.08),
            (115_648.0, 0.093),
            (590_746.0, 0.103),
            (708_890.0, 0.113),
            (1_181_484.0, 0.123),
            (1_999_999.0, 0.133),
        ])
    }

    pub fn amt_2020() -> Self {
        Self::from_sorted(&[(0.0, 0.26), (197_900.0, 0.28)])
    }

    /// Medicare including the 0.9% additional tax above $250k.
    pub fn medicare_2020() -> Self {
        Self::from_sorted(&[(0.0, 0.0145), (250_000.0, 0.0145 + 0.009)])
    }

    pub fn social_security_2020() -> Self {
        Self::from_sorted(&[(0.0, 0.062), (137_700.0, 0.0)])
    }

    pub fn california_sdi_2020() -> Self {
        Self::from_sorted(&[(0.0, 0.01), (122_909.0, 0.0)])
    }
}

pub fn apply_tax_table(value: f64, table: &TaxTable) -> f64 {
    table.apply(value)
}

/// AMT exemption after the linear phase-out above `rolloff_threshold`.
pub fn amt_exemption(amt_income: f64, base: f64, rolloff_threshold: f64) -> f64 {
    if amt_income <= rolloff_threshold {
        base
    } else if amt_income > rolloff_threshold + base / AMT_EXEMPTION_PHASE_OUT_RATE {
        0.0
    } else {
        base - (amt_income - rolloff_threshold) * AMT_EXEMPTION_PHASE_OUT_RATE
    }
}

/// ISO exercise income at which AMT starts to exceed the regular tax.
///
/// Resets `iso_exercise_income_usd` to `lo` before sweeping and restores
/// whatever it was afterwards.
pub fn amt_crossover(
    graph: &mut ComputationGraph,
    lo: f64,
    hi: f64,
    step: f64,
    rounds: u32,
) -> Result<SolveResult, ModelError> {
    let prior = graph.override_value(ISO_EXERCISE_INCOME_USD).cloned();
    graph.override_node(ISO_EXERCISE_INCOME_USD, lo)?;
    let result = solve_for(
        graph,
        &SolveConfig {
            input: ISO_EXERCISE_INCOME_USD.to_string(),
            output: AMT_EXCESS_USD.to_string(),
            target: 0.0,
            lo,
            hi,
            step,
            rounds,
        },
    );
    match prior {
        Some(value) => graph.override_node(ISO_EXERCISE_INCOME_USD, value)?,
        None => graph.revert(ISO_EXERCISE_INCOME_USD)?,
    }
    result
}

fn sum(graph: &ComputationGraph, names: &[&str]) -> Result<f64, ModelError> {
    names.iter().map(|name| graph.number(name)).sum()
}

fn taxed(graph: &ComputationGraph, income: &str, table: &str) -> Result<f64, ModelError> {
    Ok(graph.table(table)?.apply(graph.number(income)?))
}

fn ordinary_income(graph: &ComputationGraph) -> Result<f64, ModelError> {
    sum(
        graph,
        &[
            REG_INCOME_USD,
            RSU_VESTING_TAXABLE_INCOME_USD,
            NSO_INCOME_USD,
            ISO_SALES_INCOME_USD,
        ],
    )
}

fn register_usd(
    graph: &mut ComputationGraph,
    name: &'static str,
    derive: fn(&ComputationGraph) -> Result<f64, ModelError>,
) {
    graph.register_fn(name, move |g| derive(g).map(Value::Number));
}

/// Registers itemized deductions (always zero) and every derived tax node.
pub fn register(graph: &mut ComputationGraph) {
    graph.register(FED_ITEMIZED_DEDUCTIONS_USD, 0.0);
    graph.register(STATE_ITEMIZED_DEDUCTIONS_USD, 0.0);

    register_usd(graph, TAX_EXEMPT_CONTRIBUTIONS_USD, |g| {
        sum(g, &[PRETAX_401K_USD, PRETAX_FSA_USD, PRETAX_DCRA_USD])
    });
    // Double-trigger RSUs: everything vested is recognised at the liquidity event.
    register_usd(graph, RSU_VESTING_TAXABLE_INCOME_USD, |g| {
        g.number(SHARES_VESTED_RSU_USD)
    });

    register_usd(graph, FED_TAX_DEDUCTION_USD, |g| {
        Ok(g.number(FED_ITEMIZED_DEDUCTIONS_USD)?
            .max(g.number(FED_STD_DEDUCTION_USD)?))
    });
    register_usd(graph, FED_TAXABLE_INCOME_USD, |g| {
        Ok(ordinary_income(g)?
            - g.number(FED_TAX_DEDUCTION_USD)?
            - g.number(TAX_EXEMPT_CONTRIBUTIONS_USD)?)
    });
    register_usd(graph, FED_REG_INCOME_TAXES_USD, |g| {
        taxed(g, FED_TAXABLE_INCOME_USD, FED_TAX_TABLE)
    });
    register_usd(graph, FED_MEDICARE_TAXES_USD, |g| {
        taxed(g, FED_TAXABLE_INCOME_USD, MEDICARE_TAX_TABLE)
    });
    register_usd(graph, FED_SS_TAXES_USD, |g| {
        taxed(g, FED_TAXABLE_INCOME_USD, SS_TAX_TABLE)
    });
    register_usd(graph, FED_PAYROLL_TAXES_USD, |g| {
        sum(g, &[FED_MEDICARE_TAXES_USD, FED_SS_TAXES_USD])
    });

    register_usd(graph, AMT_BASE_INCOME_USD, |g| {
        Ok(sum(
            g,
            &[
                REG_INCOME_USD,
                RSU_VESTING_TAXABLE_INCOME_USD,
                NSO_INCOME_USD,
                ISO_EXERCISE_INCOME_USD,
                ISO_SALES_INCOME_USD,
                EXT_AMT_INCOME_USD,
            ],
        )? - g.number(TAX_EXEMPT_CONTRIBUTIONS_USD)?)
    });
    register_usd(graph, AMT_EXEMPTION_USD, |g| {
        Ok(amt_exemption(
            g.number(AMT_BASE_INCOME_USD)?,
            g.number(AMT_EXEMPTION_BASE_USD)?,
            g.number(AMT_EXEMPTION_ROLLOFF_THRESHOLD_USD)?,
        ))
    });
    register_usd(graph, AMT_TAXABLE_INCOME_USD, |g| {
        Ok((g.number(AMT_BASE_INCOME_USD)? - g.number(AMT_EXEMPTION_USD)?).max(0.0))
    });
    register_usd(graph, AMT_TAXES_USD, |g| {
        taxed(g, AMT_TAXABLE_INCOME_USD, AMT_TAX_TABLE)
    });
    register_usd(graph, AMT_EXCESS_USD, |g| {
        Ok(g.number(AMT_TAXES_USD)? - g.number(FED_REG_INCOME_TAXES_USD)?)
    });

    register_usd(graph, FED_TAXES_USD, |g| {
        let income_tax = g
            .number(FED_REG_INCOME_TAXES_USD)?
            .max(g.number(AMT_TAXES_USD)?);
        Ok(income_tax + g.number(FED_PAYROLL_TAXES_USD)?)
    });

    register_usd(graph, STATE_TAX_DEDUCTION_USD, |g| {
        Ok(g.number(STATE_ITEMIZED_DEDUCTIONS_USD)?
            .max(g.number(STATE_STD_DEDUCTION_USD)?))
    });
    register_usd(graph, STATE_TAXABLE_INCOME_USD, |g| {
        Ok(ordinary_income(g)?
            - g.number(STATE_TAX_DEDUCTION_USD)?
            - g.number(TAX_EXEMPT_CONTRIBUTIONS_USD)?)
    });
    register_usd(graph, STATE_REG_INCOME_TAXES_USD, |g| {
        taxed(g, STATE_TAXABLE_INCOME_USD, STATE_TAX_TABLE)
    });
    register_usd(graph, STATE_SDI_TAXES_USD, |g| {
        taxed(g, STATE_TAXABLE_INCOME_USD, SDI_TAX_TABLE)
    });
    register_usd(graph, STATE_TAXES_USD, |g| {
        sum(g, &[STATE_REG_INCOME_TAXES_USD, STATE_SDI_TAXES_USD])
    });

    register_usd(graph, TAX_BURDEN_USD, |g| {
        sum(g, &[FED_TAXES_USD, STATE_TAXES_USD])
    });
    register_usd(graph, FED_TAX_OUTSTANDING_USD, |g| {
        Ok(g.number(FED_TAXES_USD)?
            - g.number(FED_WITHHELD_USD)?
            - g.number(SHARES_WITHHELD_RSU_FED_USD)?)
    });
    register_usd(graph, STATE_TAX_OUTSTANDING_USD, |g| {
        Ok(g.number(STATE_TAXES_USD)?
            - g.number(STATE_WITHHELD_USD)?
            - g.number(SHARES_WITHHELD_RSU_STATE_USD)?)
    });
    register_usd(graph, TAX_OUTSTANDING_USD, |g| {
        sum(g, &[FED_TAX_OUTSTANDING_USD, STATE_TAX_OUTSTANDING_USD])
    });
    register_usd(graph, CASH_AFTER_TAXES_USD, |g| {
        Ok(g.number(SALE_PROCEEDS_USD)? - g.number(TAX_OUTSTANDING_USD)?)
    });

    graph.register_fn(RSU_SHARES_TO_COVER_N, |g| {
        let outstanding = g.number(TAX_OUTSTANDING_USD)?;
        if outstanding <= 0.0 {
            return Ok(Value::Shares(0));
        }
        let price = g.number(PRICE_USD)?;
        if price <= 0.0 {
            return Err(ModelError::config(
                "price_usd must be > 0 to cover outstanding tax with shares",
            ));
        }
        Ok(Value::Shares((outstanding / price).ceil() as Shares))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scenario::{ScenarioConfig, build_graph};
    use proptest::prelude::{prop_assert, proptest};

    const EPS: f64 = 1e-6;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn toy_table() -> TaxTable {
        TaxTable::new([(0.0, 0.1), (100.0, 0.2), (1000.0, 0.5)]).expect("valid table")
    }

    fn model() -> ComputationGraph {
        let config = ScenarioConfig {
            price_usd: 1.0,
            fed_std_deduction_usd: 1.0,
            state_std_deduction_usd: 1.0,
            ..ScenarioConfig::default()
        };
        build_graph(&config).expect("scenario builds")
    }

    fn set_all_income(graph: &mut ComputationGraph) {
        for node in [
            FED_TAXABLE_INCOME_USD,
            FED_TAX_DEDUCTION_USD,
            AMT_BASE_INCOME_USD,
            AMT_TAXABLE_INCOME_USD,
            FED_PAYROLL_TAXES_USD,
            FED_ITEMIZED_DEDUCTIONS_USD,
            FED_REG_INCOME_TAXES_USD,
            RSU_VESTING_TAXABLE_INCOME_USD,
            STATE_REG_INCOME_TAXES_USD,
            STATE_TAXABLE_INCOME_USD,
            STATE_TAX_DEDUCTION_USD,
            STATE_ITEMIZED_DEDUCTIONS_USD,
            SHARES_WITHHELD_RSU_FED_USD,
            SHARES_WITHHELD_RSU_STATE_USD,
            TAX_EXEMPT_CONTRIBUTIONS_USD,
            AMT_EXEMPTION_USD,
            EXT_AMT_INCOME_USD,
        ] {
            graph.override_node(node, 100.0).expect("known node");
        }
    }

    #[test]
    fn tax_table_applies_marginal_brackets() {
        let table = toy_table();
        for (value, expected) in [
            (0.0, 0.0),
            (50.0, 5.0),
            (100.0, 10.0),
            (110.0, 12.0),
            (200.0, 30.0),
            (1000.0, 190.0),
            (5000.0, 2190.0),
        ] {
            assert_approx(apply_tax_table(value, &table), expected);
        }
    }

    #[test]
    fn tax_table_sorts_and_validates_brackets() {
        let table = TaxTable::new([(1000.0, 0.5), (0.0, 0.1), (100.0, 0.2)]).expect("valid");
        assert_eq!(table, toy_table());
        assert_approx(table.max_rate(), 0.5);

        assert!(TaxTable::new([]).is_err());
        assert!(TaxTable::new([(0.0, 0.1), (0.0, 0.2)]).is_err());
        assert!(TaxTable::new([(0.0, 1.5)]).is_err());
        assert!(TaxTable::new([(-5.0, 0.1)]).is_err());
    }

    #[test]
    fn tax_table_reads_json_pairs() {
        let table: TaxTable =
            serde_json::from_str("[[1000, 0.5], [0, 0.1], [100, 0.2]]").expect("parses");
        assert_eq!(table, toy_table());
        assert!(serde_json::from_str::<TaxTable>("[[0, 2.0]]").is_err());
    }

    #[test]
    fn default_tables_round_to_cents() {
        assert_approx(TaxTable::medicare_2020().max_rate(), 0.0235);
        assert_approx(TaxTable::social_security_2020().apply(200_000.0), 8537.4);
        assert_approx(TaxTable::federal_mfj_2020().apply(175_200.0), 30_207.0);
    }

    #[test]
    fn exempt_contributions_sum_pretax_accounts() {
        let mut graph = model();
        graph.override_node(PRETAX_401K_USD, 3840.0).expect("override");
        graph.override_node(PRETAX_FSA_USD, 2750.0).expect("override");
        graph.override_node(PRETAX_DCRA_USD, 5000.0).expect("override");
        assert_approx(graph.number(TAX_EXEMPT_CONTRIBUTIONS_USD).expect("sum"), 11_590.0);
    }

    #[test]
    fn fed_taxes_take_larger_of_regular_and_amt() {
        let mut graph = model();
        graph.override_node(FED_PAYROLL_TAXES_USD, 50.0).expect("override");
        graph.override_node(FED_REG_INCOME_TAXES_USD, 100.0).expect("override");

        graph.override_node(AMT_TAXES_USD, 75.0).expect("override");
        assert_approx(graph.number(FED_TAXES_USD).expect("fed"), 150.0);

        graph.override_node(AMT_TAXES_USD, 150.0).expect("override");
        assert_approx(graph.number(FED_TAXES_USD).expect("fed"), 200.0);
    }

    #[test]
    fn deductions_take_larger_of_itemized_and_standard() {
        let mut graph = model();
        for (itemized, standard_node, node) in [
            (FED_ITEMIZED_DEDUCTIONS_USD, FED_STD_DEDUCTION_USD, FED_TAX_DEDUCTION_USD),
            (STATE_ITEMIZED_DEDUCTIONS_USD, STATE_STD_DEDUCTION_USD, STATE_TAX_DEDUCTION_USD),
        ] {
            let standard = graph.number(standard_node).expect("standard");
            for delta in [1.0, 0.0, -1.0] {
                graph.override_node(itemized, standard + delta).expect("override");
                assert_approx(graph.number(node).expect("deduction"), standard + delta.max(0.0));
            }
            graph.revert(itemized).expect("revert");
            assert_approx(graph.number(itemized).expect("itemized"), 0.0);
        }
    }

    #[test]
    fn tax_nodes_apply_their_tables() {
        let pairs = [
            (FED_TAX_TABLE, FED_TAXABLE_INCOME_USD, FED_REG_INCOME_TAXES_USD),
            (MEDICARE_TAX_TABLE, FED_TAXABLE_INCOME_USD, FED_MEDICARE_TAXES_USD),
            (SS_TAX_TABLE, FED_TAXABLE_INCOME_USD, FED_SS_TAXES_USD),
            (AMT_TAX_TABLE, AMT_TAXABLE_INCOME_USD, AMT_TAXES_USD),
            (STATE_TAX_TABLE, STATE_TAXABLE_INCOME_USD, STATE_REG_INCOME_TAXES_USD),
        ];
        for (table, income, tax) in pairs {
            let mut graph = model();
            graph.override_node(table, toy_table()).expect("override");
            graph.override_node(income, 1000.0).expect("override");
            assert_approx(graph.number(tax).expect("tax"), 190.0);
        }
    }

    #[test]
    fn amt_base_income_adds_preference_items() {
        let mut graph = model();
        set_all_income(&mut graph);
        for node in [
            REG_INCOME_USD,
            EXT_AMT_INCOME_USD,
            RSU_VESTING_TAXABLE_INCOME_USD,
            NSO_INCOME_USD,
            ISO_SALES_INCOME_USD,
            ISO_EXERCISE_INCOME_USD,
            TAX_EXEMPT_CONTRIBUTIONS_USD,
        ] {
            graph.override_node(node, 1.0).expect("override");
        }
        graph.revert(AMT_BASE_INCOME_USD).expect("revert");
        assert_approx(graph.number(AMT_BASE_INCOME_USD).expect("base"), 5.0);
    }

    #[test]
    fn amt_taxable_income_subtracts_exemption() {
        let mut graph = model();
        set_all_income(&mut graph);
        graph.override_node(AMT_BASE_INCOME_USD, 2.0).expect("override");
        graph.override_node(AMT_EXEMPTION_USD, 1.0).expect("override");
        graph.revert(AMT_TAXABLE_INCOME_USD).expect("revert");
        assert_approx(graph.number(AMT_TAXABLE_INCOME_USD).expect("taxable"), 1.0);

        graph.override_node(AMT_EXEMPTION_USD, 5.0).expect("override");
        assert_approx(graph.number(AMT_TAXABLE_INCOME_USD).expect("taxable"), 0.0);
    }

    #[test]
    fn amt_exemption_phases_out() {
        let mut graph = model();
        let threshold = 1_036_800.0;
        let base = 113_400.0;
        for (income, expected) in [
            (0.0, base),
            (threshold - 1.0, base),
            (threshold, base),
            (threshold + 4.0, base - 1.0),
            (threshold + 4.0 * base, 0.0),
            (threshold + 4.0 * base + 1.0, 0.0),
        ] {
            graph.override_node(AMT_BASE_INCOME_USD, income).expect("override");
            assert_approx(graph.number(AMT_EXEMPTION_USD).expect("exemption"), expected);
        }
    }

    #[test]
    fn taxable_income_subtracts_deduction_and_contributions() {
        let mut graph = model();
        set_all_income(&mut graph);
        for node in [
            REG_INCOME_USD,
            NSO_INCOME_USD,
            ISO_SALES_INCOME_USD,
            RSU_VESTING_TAXABLE_INCOME_USD,
            TAX_EXEMPT_CONTRIBUTIONS_USD,
            FED_TAX_DEDUCTION_USD,
            STATE_TAX_DEDUCTION_USD,
        ] {
            graph.override_node(node, 1.0).expect("override");
        }
        graph.revert(FED_TAXABLE_INCOME_USD).expect("revert");
        graph.revert(STATE_TAXABLE_INCOME_USD).expect("revert");
        assert_approx(graph.number(FED_TAXABLE_INCOME_USD).expect("fed"), 2.0);
        assert_approx(graph.number(STATE_TAXABLE_INCOME_USD).expect("state"), 2.0);
    }

    #[test]
    fn payroll_state_and_burden_sum_components() {
        let mut graph = model();
        set_all_income(&mut graph);
        graph.override_node(FED_SS_TAXES_USD, 1.0).expect("override");
        graph.override_node(FED_MEDICARE_TAXES_USD, 1.0).expect("override");
        graph.revert(FED_PAYROLL_TAXES_USD).expect("revert");
        assert_approx(graph.number(FED_PAYROLL_TAXES_USD).expect("payroll"), 2.0);

        graph.override_node(STATE_SDI_TAXES_USD, 1.0).expect("override");
        graph.override_node(STATE_REG_INCOME_TAXES_USD, 1.0).expect("override");
        assert_approx(graph.number(STATE_TAXES_USD).expect("state"), 2.0);

        graph.override_node(FED_TAXES_USD, 3.0).expect("override");
        assert_approx(graph.number(TAX_BURDEN_USD).expect("burden"), 5.0);
    }

    #[test]
    fn sdi_applies_capped_table() {
        let mut graph = model();
        set_all_income(&mut graph);
        graph
            .override_node(
                SDI_TAX_TABLE,
                TaxTable::new([(0.0, 0.01), (1000.0, 0.0)]).expect("valid"),
            )
            .expect("override");
        assert_approx(graph.number(STATE_SDI_TAXES_USD).expect("sdi"), 1.0);
    }

    #[test]
    fn outstanding_tax_nets_all_withholding() {
        let mut graph = model();
        graph.override_node(FED_TAXES_USD, 1000.0).expect("override");
        graph.override_node(STATE_TAXES_USD, 400.0).expect("override");
        graph.override_node(FED_WITHHELD_USD, 300.0).expect("override");
        graph.override_node(STATE_WITHHELD_USD, 100.0).expect("override");
        graph.override_node(SHARES_WITHHELD_RSU_FED_USD, 200.0).expect("override");
        graph.override_node(SHARES_WITHHELD_RSU_STATE_USD, 50.0).expect("override");
        graph.override_node(SALE_PROCEEDS_USD, 2000.0).expect("override");
        graph.override_node(PRICE_USD, 7.0).expect("override");

        assert_approx(graph.number(FED_TAX_OUTSTANDING_USD).expect("fed"), 500.0);
        assert_approx(graph.number(STATE_TAX_OUTSTANDING_USD).expect("state"), 250.0);
        assert_approx(graph.number(TAX_OUTSTANDING_USD).expect("total"), 750.0);
        assert_approx(graph.number(CASH_AFTER_TAXES_USD).expect("cash"), 1250.0);
        assert_eq!(graph.shares(RSU_SHARES_TO_COVER_N).expect("cover"), 108);

        graph.override_node(FED_WITHHELD_USD, 5000.0).expect("override");
        assert_eq!(graph.shares(RSU_SHARES_TO_COVER_N).expect("cover"), 0);
    }

    #[test]
    fn amt_crossover_finds_where_amt_binds() {
        let mut graph = build_graph(&ScenarioConfig {
            reg_income_usd: 200_000.0,
            ..ScenarioConfig::default()
        })
        .expect("scenario builds");

        assert_approx(graph.number(FED_REG_INCOME_TAXES_USD).expect("regular"), 30_207.0);
        assert!(graph.number(AMT_EXCESS_USD).expect("excess") < 0.0);

        let result = amt_crossover(&mut graph, 0.0, 500_000.0, 10_000.0, 3).expect("crossing");
        // 0.26 * (200000 - 113400 + x) >= 30207
        let exact = 30_207.0 / 0.26 - 86_600.0;
        assert!(result.solution >= exact);
        assert!(result.solution - exact <= result.precision + EPS);
        assert!(result.achieved_output >= 0.0);
        assert!(!graph.is_overridden(ISO_EXERCISE_INCOME_USD));
        assert_approx(graph.number(ISO_EXERCISE_INCOME_USD).expect("iso"), 0.0);
    }

    #[test]
    fn amt_crossover_reports_no_crossing() {
        let mut graph = build_graph(&ScenarioConfig {
            reg_income_usd: 200_000.0,
            ..ScenarioConfig::default()
        })
        .expect("scenario builds");
        graph.override_node(ISO_EXERCISE_INCOME_USD, 1.0).expect("override");
        let err = amt_crossover(&mut graph, 0.0, 10_000.0, 1_000.0, 2).expect_err("no crossing");
        assert!(matches!(err, ModelError::SolverNoCrossingFound { .. }));
        assert_eq!(
            graph.override_value(ISO_EXERCISE_INCOME_USD),
            Some(&Value::Number(1.0))
        );
    }

    proptest! {
        #[test]
        fn tax_is_monotone_and_bounded_by_top_rate(a in 0.0f64..3_000_000.0, b in 0.0f64..3_000_000.0) {
            let table = TaxTable::federal_mfj_2020();
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(table.apply(lo) <= table.apply(hi) + 0.01);
            prop_assert!(table.apply(hi) <= hi * table.max_rate() + 0.01);
        }
    }
}
