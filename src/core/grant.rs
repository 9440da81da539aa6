use chrono::{Datelike, Months, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize};

use super::error::ModelError;
use super::types::{Shares, Vehicle};

/// Absorbs binary noise in `shares * rate` products before rounding up,
/// so that e.g. `10 * 0.3` withholds 3 shares rather than 4.
const SHARE_EPSILON: f64 = 1e-9;

/// Parses `m/d/yy`, `m/d/yyyy` or ISO `yyyy-mm-dd`.
pub fn parse_date(text: &str) -> Result<NaiveDate, ModelError> {
    let text = text.trim();
    let format = if text.contains('-') {
        "%Y-%m-%d"
    } else if text.rsplit('/').next().is_some_and(|year| year.len() == 4) {
        "%m/%d/%Y"
    } else {
        "%m/%d/%y"
    };
    NaiveDate::parse_from_str(text, format).map_err(|_| ModelError::InvalidDate(text.to_string()))
}

pub(crate) fn deserialize_date<'de, D>(deserializer: D) -> Result<NaiveDate, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    parse_date(&text).map_err(serde::de::Error::custom)
}

fn is_month_end(date: NaiveDate) -> bool {
    date.succ_opt().is_none_or(|next| next.month() != date.month())
}

/// Whole months between two dates, counted the way a banker would.
///
/// A partial trailing month is dropped, except that two month-end dates
/// (Jan 31 -> Feb 29) are a full month apart. Never negative.
pub fn month_diff(start: NaiveDate, end: NaiveDate) -> i64 {
    let mut months = 12 * i64::from(end.year() - start.year()) + i64::from(end.month())
        - i64::from(start.month());
    let both_month_end = is_month_end(start) && is_month_end(end);
    if end.day() < start.day() && !both_month_end {
        months -= 1;
    }
    months.max(0)
}

/// `round(num / den)` with ties to even, in exact integer arithmetic.
fn ratio_round_half_even(num: i64, den: i64) -> i64 {
    let quotient = num / den;
    let twice_remainder = 2 * (num % den);
    if twice_remainder > den || (twice_remainder == den && quotient % 2 == 1) {
        quotient + 1
    } else {
        quotient
    }
}

fn check_rate(rate: f64) -> Result<(), ModelError> {
    if rate.is_finite() && (0.0..=1.0).contains(&rate) {
        Ok(())
    } else {
        Err(ModelError::invariant(format!(
            "withholding rate {rate} must be within [0, 1]"
        )))
    }
}

fn withheld_from(vested: Shares, rate: f64) -> Shares {
    (vested as f64 * rate - SHARE_EPSILON).ceil().max(0.0) as Shares
}

fn default_periods() -> u32 {
    48
}

fn default_period_months() -> u32 {
    1
}

/// Raw grant description as it arrives from a scenario file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantSpec {
    pub name: String,
    pub vehicle: Vehicle,
    pub shares: Shares,
    #[serde(default)]
    pub cliff: Shares,
    #[serde(deserialize_with = "deserialize_date")]
    pub start: NaiveDate,
    #[serde(default = "default_periods")]
    pub periods: u32,
    #[serde(default = "default_period_months")]
    pub period_months: u32,
    #[serde(default)]
    pub negative_cliff: bool,
    #[serde(default)]
    pub strike_usd: f64,
    #[serde(default)]
    pub exercised: Shares,
    #[serde(default)]
    pub sold: Shares,
    #[serde(default)]
    pub withheld: Shares,
}

impl GrantSpec {
    pub fn new(
        name: impl Into<String>,
        vehicle: Vehicle,
        shares: Shares,
        start: NaiveDate,
    ) -> Self {
        Self {
            name: name.into(),
            vehicle,
            shares,
            cliff: 0,
            start,
            periods: default_periods(),
            period_months: default_period_months(),
            negative_cliff: false,
            strike_usd: 0.0,
            exercised: 0,
            sold: 0,
            withheld: 0,
        }
    }
}

/// One row of a broker vesting schedule.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct VestingRow {
    #[serde(deserialize_with = "deserialize_date")]
    pub date: NaiveDate,
    pub shares: Shares,
}

/// The first, second and last rows of a broker vesting schedule, enough to
/// recover cliff, cadence and period count.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VestingTable {
    pub name: String,
    pub vehicle: Vehicle,
    pub first: VestingRow,
    pub second: VestingRow,
    pub last: VestingRow,
    pub shares: Shares,
    #[serde(default)]
    pub exercised: Shares,
    #[serde(default)]
    pub sold: Shares,
    #[serde(default)]
    pub strike_usd: f64,
}

/// What a sale did (or would do) to one grant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleOutcome {
    pub sold_from_held: Shares,
    pub sold_from_outstanding: Shares,
    pub cost_usd: f64,
    pub gross_usd: f64,
    pub net_usd: f64,
}

/// A single equity award and its vesting schedule.
///
/// `exercised` counts shares converted to stock (for RSUs: delivered),
/// `sold` counts shares sold, and `withheld` records shares retained by
/// automatic sell-to-cover. Vesting itself is never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "GrantSpec", rename_all = "camelCase")]
pub struct Grant {
    name: String,
    vehicle: Vehicle,
    shares: Shares,
    cliff: Shares,
    start: NaiveDate,
    periods: u32,
    period_months: u32,
    negative_cliff: bool,
    strike_usd: f64,
    exercised: Shares,
    sold: Shares,
    withheld: Shares,
}

impl TryFrom<GrantSpec> for Grant {
    type Error = ModelError;

    fn try_from(spec: GrantSpec) -> Result<Self, Self::Error> {
        Grant::new(spec)
    }
}

impl Grant {
    pub fn new(spec: GrantSpec) -> Result<Self, ModelError> {
        if spec.name.trim().is_empty() {
            return Err(ModelError::config("grant name must not be empty"));
        }
        let name = &spec.name;
        if spec.shares <= 0 {
            return Err(ModelError::config(format!("grant {name}: shares must be > 0")));
        }
        if !(0..=spec.shares).contains(&spec.cliff) {
            return Err(ModelError::config(format!(
                "grant {name}: cliff must be between 0 and {}",
                spec.shares
            )));
        }
        if spec.periods == 0 || spec.period_months == 0 {
            return Err(ModelError::config(format!(
                "grant {name}: periods and period months must be > 0"
            )));
        }
        if !spec.strike_usd.is_finite() || spec.strike_usd < 0.0 {
            return Err(ModelError::config(format!(
                "grant {name}: strike must be a non-negative amount"
            )));
        }
        match spec.vehicle {
            Vehicle::Rsu if spec.strike_usd != 0.0 => {
                return Err(ModelError::config(format!(
                    "grant {name}: RSUs carry no strike price"
                )));
            }
            Vehicle::Nso | Vehicle::Iso if spec.strike_usd == 0.0 => {
                return Err(ModelError::config(format!(
                    "grant {name}: options need a strike price > 0"
                )));
            }
            _ => {}
        }

        let grant = Self {
            name: spec.name,
            vehicle: spec.vehicle,
            shares: spec.shares,
            cliff: spec.cliff,
            start: spec.start,
            periods: spec.periods,
            period_months: spec.period_months,
            negative_cliff: spec.negative_cliff,
            strike_usd: spec.strike_usd,
            exercised: spec.exercised,
            sold: spec.sold,
            withheld: spec.withheld,
        };
        grant.check_counts()?;
        Ok(grant)
    }

    /// Rebuilds a grant from three rows of a broker vesting schedule.
    pub fn from_vesting_table(table: VestingTable) -> Result<Self, ModelError> {
        let name = &table.name;
        let period_months = month_diff(table.first.date, table.second.date);
        if period_months <= 0 {
            return Err(ModelError::config(format!(
                "grant {name}: second vesting row must be at least a month after the first"
            )));
        }
        let full_months = month_diff(table.first.date, table.last.date);
        if full_months % period_months != 0 {
            return Err(ModelError::config(format!(
                "grant {name}: {full_months} months of vesting is not a whole number of \
                 {period_months}-month periods"
            )));
        }
        let periods = full_months / period_months;
        if periods < 2 {
            return Err(ModelError::config(format!(
                "grant {name}: vesting table spans fewer than two periods"
            )));
        }

        let regular_pool = table.shares - table.first.shares - table.last.shares;
        let regular_vest = (regular_pool as f64 / (periods - 1) as f64).round_ties_even() as Shares;
        if regular_vest != table.second.shares {
            return Err(ModelError::config(format!(
                "grant {name}: invalid number of shares specified {regular_vest} vs {}",
                table.second.shares
            )));
        }

        let periods = u32::try_from(periods)
            .map_err(|_| ModelError::config(format!("grant {name}: too many vesting periods")))?;
        let period_months = u32::try_from(period_months)
            .map_err(|_| ModelError::config(format!("grant {name}: vesting period too long")))?;

        Grant::new(GrantSpec {
            name: table.name,
            vehicle: table.vehicle,
            shares: table.shares,
            cliff: table.first.shares,
            start: table.first.date,
            periods,
            period_months,
            negative_cliff: table.last.shares < table.second.shares - 1,
            strike_usd: table.strike_usd,
            exercised: table.exercised,
            sold: table.sold,
            withheld: 0,
        })
    }

    fn check_counts(&self) -> Result<(), ModelError> {
        let name = &self.name;
        if !(0..=self.shares).contains(&self.exercised) {
            return Err(ModelError::invariant(format!(
                "grant {name}: exercised {} outside 0..={}",
                self.exercised, self.shares
            )));
        }
        if self.sold < 0 || self.withheld < 0 {
            return Err(ModelError::invariant(format!(
                "grant {name}: negative sold or withheld count"
            )));
        }
        if self.vehicle.is_option() && self.sold > self.exercised {
            return Err(ModelError::invariant(format!(
                "grant {name}: sold {} exceeds exercised {}",
                self.sold, self.exercised
            )));
        }
        if self.sold + self.withheld > self.shares {
            return Err(ModelError::invariant(format!(
                "grant {name}: sold and withheld exceed {} granted shares",
                self.shares
            )));
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vehicle(&self) -> Vehicle {
        self.vehicle
    }

    pub fn total(&self) -> Shares {
        self.shares
    }

    pub fn cliff(&self) -> Shares {
        self.cliff
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn periods(&self) -> u32 {
        self.periods
    }

    pub fn period_months(&self) -> u32 {
        self.period_months
    }

    pub fn negative_cliff(&self) -> bool {
        self.negative_cliff
    }

    pub fn strike_usd(&self) -> f64 {
        self.strike_usd
    }

    pub fn exercised(&self) -> Shares {
        self.exercised
    }

    pub fn sold(&self) -> Shares {
        self.sold
    }

    /// Shares recorded as retained by automatic sell-to-cover.
    pub fn recorded_withholding(&self) -> Shares {
        self.withheld
    }

    /// First date on which the grant is fully vested.
    pub fn fully_vested_on(&self) -> Option<NaiveDate> {
        let months = self.periods.checked_mul(self.period_months)?;
        self.start.checked_add_months(Months::new(months))
    }

    /// Cumulative vested shares as of `on`.
    ///
    /// Cliff shares vest at period 0; the regular pool vests linearly with
    /// `round_half_even(periods * pool / n_periods)`. A negative cliff keeps
    /// the whole grant in the regular pool and front-loads the cliff.
    pub fn vested(&self, on: NaiveDate) -> Result<Shares, ModelError> {
        if on < self.start {
            return Ok(0);
        }

        let elapsed = month_diff(self.start, on) / i64::from(self.period_months);
        let periods = elapsed.min(i64::from(self.periods));

        let vested = if periods >= i64::from(self.periods) {
            self.shares
        } else {
            let pool = if self.negative_cliff {
                self.shares
            } else {
                self.shares - self.cliff
            };
            let regular = ratio_round_half_even(periods * pool, i64::from(self.periods));
            (regular + self.cliff).min(self.shares)
        };

        if vested < self.exercised {
            return Err(ModelError::invariant(format!(
                "grant {}: {vested} shares vested on {on} but {} already exercised",
                self.name, self.exercised
            )));
        }
        if !self.vehicle.is_option() && vested < self.sold {
            return Err(ModelError::invariant(format!(
                "grant {}: {vested} shares vested on {on} but {} already sold",
                self.name, self.sold
            )));
        }
        Ok(vested)
    }

    pub fn unvested(&self, on: NaiveDate) -> Result<Shares, ModelError> {
        Ok(self.shares - self.vested(on)?)
    }

    pub fn vested_outstanding(&self, on: NaiveDate) -> Result<Shares, ModelError> {
        Ok(self.vested(on)? - self.exercised)
    }

    pub fn vested_unsold(&self, on: NaiveDate) -> Result<Shares, ModelError> {
        Ok(self.vested(on)? - self.sold - self.withheld)
    }

    pub fn outstanding(&self) -> Shares {
        self.shares - self.exercised
    }

    /// Exercised (delivered) stock not yet sold.
    pub fn held(&self) -> Shares {
        (self.exercised - self.sold).max(0)
    }

    pub fn outstanding_cost(&self) -> f64 {
        self.outstanding() as f64 * self.strike_usd
    }

    pub fn vested_outstanding_cost(&self, on: NaiveDate) -> Result<f64, ModelError> {
        Ok(self.vested_outstanding(on)? as f64 * self.strike_usd)
    }

    /// Shares withheld at vest: `ceil(vested * rate)`.
    pub fn withheld(&self, on: NaiveDate, rate: f64) -> Result<Shares, ModelError> {
        check_rate(rate)?;
        Ok(withheld_from(self.vested(on)?, rate))
    }

    /// Shares free to sell after withholding and prior sales.
    ///
    /// `round_half_even(vested * (1 - rate)) - sold`, capped at
    /// `vested - withheld(on, rate) - sold`. Withholding rounds up while the
    /// uncapped term rounds to even, so without the cap 10 shares at 0.25
    /// would leave 8 sellable next to 3 withheld. With it, withheld plus
    /// sold never exceeds vested.
    pub fn available(&self, on: NaiveDate, rate: f64) -> Result<Shares, ModelError> {
        check_rate(rate)?;
        let vested = self.vested(on)?;
        let after_withholding = (vested as f64 * (1.0 - rate)).round_ties_even() as Shares;
        Ok(after_withholding.min(vested - withheld_from(vested, rate)) - self.sold)
    }

    /// Records automatic sell-to-cover for everything vested by `on`.
    ///
    /// Assigns rather than accumulates, so applying it twice is harmless.
    pub fn record_withholding(&mut self, on: NaiveDate, rate: f64) -> Result<Shares, ModelError> {
        let withheld = self.withheld(on, rate)?;
        if self.sold + withheld > self.vested(on)? {
            return Err(ModelError::invariant(format!(
                "grant {}: {} sold plus {withheld} withheld exceed vested shares on {on}",
                self.name, self.sold
            )));
        }
        self.withheld = withheld;
        Ok(withheld)
    }

    /// Prices a sale of `n` shares without touching the grant.
    pub fn quote(
        &self,
        on: NaiveDate,
        n: Shares,
        price_usd: f64,
        rate: f64,
        prefer_exercise: bool,
    ) -> Result<SaleOutcome, ModelError> {
        if n < 0 {
            return Err(ModelError::invariant(format!(
                "grant {}: cannot sell a negative quantity ({n})",
                self.name
            )));
        }
        if !price_usd.is_finite() || price_usd < 0.0 {
            return Err(ModelError::invariant(format!(
                "grant {}: sale price {price_usd} must be a non-negative amount",
                self.name
            )));
        }

        let available = self.available(on, rate)?;
        if n > available {
            return Err(ModelError::InsufficientShares {
                grant: self.name.clone(),
                requested: n,
                available,
            });
        }

        let outstanding = self.vested_outstanding(on)?;
        let held = self.held();
        let (sold_from_held, sold_from_outstanding) = if prefer_exercise {
            let from_outstanding = n.min(outstanding);
            (n - from_outstanding, from_outstanding)
        } else {
            let from_held = n.min(held);
            (from_held, n - from_held)
        };
        if sold_from_held > held || sold_from_outstanding > outstanding {
            return Err(ModelError::invariant(format!(
                "grant {}: sale of {n} splits into {sold_from_held} held / \
                 {sold_from_outstanding} outstanding beyond {held} / {outstanding}",
                self.name
            )));
        }

        let cost_usd = sold_from_outstanding as f64 * self.strike_usd;
        let gross_usd = n as f64 * price_usd;
        Ok(SaleOutcome {
            sold_from_held,
            sold_from_outstanding,
            cost_usd,
            gross_usd,
            net_usd: gross_usd - cost_usd,
        })
    }

    /// Sells `n` shares at `price_usd`; mutates the grant only if `commit`.
    pub fn sell(
        &mut self,
        on: NaiveDate,
        n: Shares,
        price_usd: f64,
        rate: f64,
        prefer_exercise: bool,
        commit: bool,
    ) -> Result<SaleOutcome, ModelError> {
        let outcome = self.quote(on, n, price_usd, rate, prefer_exercise)?;
        if commit {
            self.sold += n;
            self.exercised += outcome.sold_from_outstanding;
            self.check_counts()?;
        }
        Ok(outcome)
    }
}
