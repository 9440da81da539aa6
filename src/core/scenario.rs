use chrono::NaiveDate;
use serde::Deserialize;
use tracing::debug;

use super::error::ModelError;
use super::graph::ComputationGraph;
use super::grant::{Grant, VestingTable, deserialize_date};
use super::income::{
    self, ISO_EXERCISE_INCOME_USD, ISO_WITHHOLDING_RATE, NSO_WITHHOLDING_RATE, RSU_FED_HOLD_RATE,
    RSU_STATE_HOLD_RATE, SALES_ORDERS,
};
use super::position::{self, GRANTS, MAX_SELLABLE_RESTRICTED_FRAC, Position};
use super::taxes::{
    self, AMT_EXEMPTION_BASE_USD, AMT_EXEMPTION_ROLLOFF_THRESHOLD_USD, AMT_TAX_TABLE,
    FED_STD_DEDUCTION_USD, FED_TAX_TABLE, MEDICARE_TAX_TABLE, SDI_TAX_TABLE, SS_TAX_TABLE,
    STATE_STD_DEDUCTION_USD, STATE_TAX_TABLE, TaxTable,
};
use super::types::SaleOrder;

pub const PRICE_USD: &str = "price_usd";
pub const QUERY_DATE: &str = "query_date";
pub const REG_INCOME_USD: &str = "reg_income_usd";
pub const EXT_AMT_INCOME_USD: &str = "ext_amt_income_usd";
pub const PRETAX_401K_USD: &str = "pretax_401k_usd";
pub const PRETAX_FSA_USD: &str = "pretax_fsa_usd";
pub const PRETAX_DCRA_USD: &str = "pretax_dcra_usd";
pub const FED_WITHHELD_USD: &str = "fed_withheld_usd";
pub const STATE_WITHHELD_USD: &str = "state_withheld_usd";

/// Every scenario input. Missing fields fall back to [`ScenarioConfig::default`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScenarioConfig {
    pub grants: Vec<Grant>,
    /// Grants described by broker vesting schedules instead of parameters.
    pub vesting_tables: Vec<VestingTable>,
    pub sales_orders: Vec<SaleOrder>,
    pub price_usd: f64,
    #[serde(deserialize_with = "deserialize_date")]
    pub query_date: NaiveDate,
    pub reg_income_usd: f64,
    pub ext_amt_income_usd: f64,
    pub iso_exercise_income_usd: f64,
    pub pretax_401k_usd: f64,
    pub pretax_fsa_usd: f64,
    pub pretax_dcra_usd: f64,
    pub fed_withheld_usd: f64,
    pub state_withheld_usd: f64,
    pub rsu_fed_hold_rate: f64,
    pub rsu_state_hold_rate: f64,
    pub nso_withholding_rate: f64,
    pub iso_withholding_rate: f64,
    pub max_sellable_restricted_frac: f64,
    pub fed_std_deduction_usd: f64,
    pub state_std_deduction_usd: f64,
    pub amt_exemption_base_usd: f64,
    pub amt_exemption_rolloff_threshold_usd: f64,
    pub fed_tax_table: TaxTable,
    pub state_tax_table: TaxTable,
    pub amt_tax_table: TaxTable,
    pub medicare_tax_table: TaxTable,
    pub ss_tax_table: TaxTable,
    pub sdi_tax_table: TaxTable,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            grants: Vec::new(),
            vesting_tables: Vec::new(),
            sales_orders: Vec::new(),
            price_usd: 12.0,
            query_date: NaiveDate::from_ymd_opt(2020, 9, 23).unwrap_or_default(),
            reg_income_usd: 0.0,
            ext_amt_income_usd: 0.0,
            iso_exercise_income_usd: 0.0,
            pretax_401k_usd: 0.0,
            pretax_fsa_usd: 0.0,
            pretax_dcra_usd: 0.0,
            fed_withheld_usd: 0.0,
            state_withheld_usd: 0.0,
            rsu_fed_hold_rate: 0.22,
            rsu_state_hold_rate: 0.1023,
            nso_withholding_rate: 0.0,
            iso_withholding_rate: 0.0,
            max_sellable_restricted_frac: 0.2,
            fed_std_deduction_usd: 24_800.0,
            state_std_deduction_usd: 4_537.0,
            amt_exemption_base_usd: 113_400.0,
            amt_exemption_rolloff_threshold_usd: 1_036_800.0,
            fed_tax_table: TaxTable::federal_mfj_2020(),
            state_tax_table: TaxTable::california_mfj_2020(),
            amt_tax_table: TaxTable::amt_2020(),
            medicare_tax_table: TaxTable::medicare_2020(),
            ss_tax_table: TaxTable::social_security_2020(),
            sdi_tax_table: TaxTable::california_sdi_2020(),
        }
    }
}

impl ScenarioConfig {
    /// Every `(node name, amount)` pair registered as a plain number.
    fn amounts(&self) -> [(&'static str, f64); 18] {
        [
            (PRICE_USD, self.price_usd),
            (REG_INCOME_USD, self.reg_income_usd),
            (EXT_AMT_INCOME_USD, self.ext_amt_income_usd),
            (ISO_EXERCISE_INCOME_USD, self.iso_exercise_income_usd),
            (PRETAX_401K_USD, self.pretax_401k_usd),
            (PRETAX_FSA_USD, self.pretax_fsa_usd),
            (PRETAX_DCRA_USD, self.pretax_dcra_usd),
            (FED_WITHHELD_USD, self.fed_withheld_usd),
            (STATE_WITHHELD_USD, self.state_withheld_usd),
            (RSU_FED_HOLD_RATE, self.rsu_fed_hold_rate),
            (RSU_STATE_HOLD_RATE, self.rsu_state_hold_rate),
            (NSO_WITHHOLDING_RATE, self.nso_withholding_rate),
            (ISO_WITHHOLDING_RATE, self.iso_withholding_rate),
            (MAX_SELLABLE_RESTRICTED_FRAC, self.max_sellable_restricted_frac),
            (FED_STD_DEDUCTION_USD, self.fed_std_deduction_usd),
            (STATE_STD_DEDUCTION_USD, self.state_std_deduction_usd),
            (AMT_EXEMPTION_BASE_USD, self.amt_exemption_base_usd),
            (
                AMT_EXEMPTION_ROLLOFF_THRESHOLD_USD,
                self.amt_exemption_rolloff_threshold_usd,
            ),
        ]
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        for (name, amount) in self.amounts() {
            if !amount.is_finite() {
                return Err(ModelError::config(format!("{name} must be finite")));
            }
        }
        if self.price_usd < 0.0 {
            return Err(ModelError::config("price_usd must be >= 0"));
        }
        for (name, rate) in [
            (RSU_FED_HOLD_RATE, self.rsu_fed_hold_rate),
            (RSU_STATE_HOLD_RATE, self.rsu_state_hold_rate),
            (NSO_WITHHOLDING_RATE, self.nso_withholding_rate),
            (ISO_WITHHOLDING_RATE, self.iso_withholding_rate),
            (MAX_SELLABLE_RESTRICTED_FRAC, self.max_sellable_restricted_frac),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(ModelError::config(format!("{name} must be between 0 and 1")));
            }
        }
        let rsu_rate =
            self.rsu_fed_hold_rate + self.rsu_state_hold_rate + self.medicare_tax_table.max_rate();
        if rsu_rate > 1.0 {
            return Err(ModelError::config(
                "RSU withholding rates must not add up to more than 1",
            ));
        }
        for (name, amount) in [
            (PRETAX_401K_USD, self.pretax_401k_usd),
            (PRETAX_FSA_USD, self.pretax_fsa_usd),
            (PRETAX_DCRA_USD, self.pretax_dcra_usd),
            (FED_STD_DEDUCTION_USD, self.fed_std_deduction_usd),
            (STATE_STD_DEDUCTION_USD, self.state_std_deduction_usd),
            (AMT_EXEMPTION_BASE_USD, self.amt_exemption_base_usd),
        ] {
            if amount < 0.0 {
                return Err(ModelError::config(format!("{name} must be >= 0")));
            }
        }
        Ok(())
    }

    /// Explicit grants followed by those rebuilt from vesting tables.
    pub fn position(&self) -> Result<Position, ModelError> {
        let mut grants = self.grants.clone();
        for table in &self.vesting_tables {
            grants.push(Grant::from_vesting_table(table.clone())?);
        }
        Position::new(grants)
    }
}

/// Registers every scenario input and the position, income and tax nodes.
pub fn build_graph(config: &ScenarioConfig) -> Result<ComputationGraph, ModelError> {
    config.validate()?;
    let position = config.position()?;

    let mut graph = ComputationGraph::new();
    graph.register(GRANTS, position);
    graph.register(SALES_ORDERS, config.sales_orders.clone());
    graph.register(QUERY_DATE, config.query_date);
    for (name, amount) in config.amounts() {
        graph.register(name, amount);
    }
    for (name, table) in [
        (FED_TAX_TABLE, &config.fed_tax_table),
        (STATE_TAX_TABLE, &config.state_tax_table),
        (AMT_TAX_TABLE, &config.amt_tax_table),
        (MEDICARE_TAX_TABLE, &config.medicare_tax_table),
        (SS_TAX_TABLE, &config.ss_tax_table),
        (SDI_TAX_TABLE, &config.sdi_tax_table),
    ] {
        graph.register(name, table.clone());
    }

    position::register(&mut graph);
    income::register(&mut graph);
    taxes::register(&mut graph);

    debug!(
        nodes = graph.names().len(),
        grants = config.grants.len() + config.vesting_tables.len(),
        "scenario graph built"
    );
    Ok(graph)
}
