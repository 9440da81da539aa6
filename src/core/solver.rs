use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::ModelError;
use super::graph::ComputationGraph;

/// Upper bound on samples in the opening sweep.
const MAX_SWEEP_SAMPLES: f64 = 100_000.0;

/// Drive `input` from `lo` to `hi` until `output` reaches `target`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolveConfig {
    pub input: String,
    pub output: String,
    pub target: f64,
    pub lo: f64,
    pub hi: f64,
    pub step: f64,
    #[serde(default = "default_rounds")]
    pub rounds: u32,
}

fn default_rounds() -> u32 {
    3
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SolveRound {
    pub round: u32,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub step: f64,
    pub solution: f64,
    pub achieved_output: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SolveResult {
    pub input: String,
    pub output: String,
    pub target: f64,
    pub solution: f64,
    pub achieved_output: f64,
    /// Step of the finest sweep that ran.
    pub precision: f64,
    pub rounds: Vec<SolveRound>,
}

struct Crossing {
    below: Option<f64>,
    at: f64,
    output: f64,
}

/// Finds the first `input` value in `[lo, hi]` at which `output >= target`.
///
/// Sweeps upward in `step` increments, then re-sweeps the bracket around
/// the first crossing with a step ten times finer, `rounds` times. Later
/// crossings are never looked at. If `output` already meets `target` at
/// `lo`, `lo` is the solution and no refinement runs; there is nothing
/// below it to cross from. The input must already sit inside `[lo, hi]`;
/// afterwards it is put back exactly as it was found.
pub fn solve_for(
    graph: &mut ComputationGraph,
    config: &SolveConfig,
) -> Result<SolveResult, ModelError> {
    validate_config(config)?;
    if !graph.contains(&config.output) {
        return Err(ModelError::UnknownNode(config.output.clone()));
    }
    let current = graph.number(&config.input)?;
    if !(config.lo..=config.hi).contains(&current) {
        return Err(ModelError::SolverInputOutOfRange {
            input: config.input.clone(),
            current,
            lo: config.lo,
            hi: config.hi,
        });
    }

    let prior = graph.override_value(&config.input).cloned();
    let outcome = search(graph, config);
    match prior {
        Some(value) => graph.override_node(&config.input, value)?,
        None => graph.revert(&config.input)?,
    }
    outcome
}

fn search(graph: &mut ComputationGraph, config: &SolveConfig) -> Result<SolveResult, ModelError> {
    let mut rounds = Vec::with_capacity(config.rounds as usize + 1);
    let mut lo = config.lo;
    let mut hi = config.hi;
    let mut step = config.step;
    let mut best: Option<(f64, f64)> = None;

    for round in 0..=config.rounds {
        let Some(crossing) = sweep(graph, config, lo, hi, step)? else {
            if best.is_some() {
                break;
            }
            return Err(ModelError::SolverNoCrossingFound {
                input: config.input.clone(),
                output: config.output.clone(),
                target: config.target,
                lo: config.lo,
                hi: config.hi,
            });
        };

        debug!(
            round,
            lo,
            hi,
            step,
            solution = crossing.at,
            output = crossing.output,
            "solver round"
        );
        rounds.push(SolveRound {
            round,
            lower_bound: lo,
            upper_bound: hi,
            step,
            solution: crossing.at,
            achieved_output: crossing.output,
        });
        best = Some((crossing.at, crossing.output));

        // Crossing on the very first sample: nothing below it to refine.
        let Some(below) = crossing.below else {
            break;
        };
        lo = below;
        hi = crossing.at;
        step /= 10.0;
    }

    let (solution, achieved_output) = best.ok_or_else(|| {
        ModelError::invariant(format!("solver for {} finished without a round", config.input))
    })?;
    let precision = rounds.last().map_or(config.step, |r: &SolveRound| r.step);
    Ok(SolveResult {
        input: config.input.clone(),
        output: config.output.clone(),
        target: config.target,
        solution,
        achieved_output,
        precision,
        rounds,
    })
}

fn sweep(
    graph: &mut ComputationGraph,
    config: &SolveConfig,
    lo: f64,
    hi: f64,
    step: f64,
) -> Result<Option<Crossing>, ModelError> {
    let mut below = None;
    let mut k = 0_u32;
    loop {
        let x = (lo + f64::from(k) * step).min(hi);
        graph.override_node(&config.input, x)?;
        let y = graph.number(&config.output)?;
        if y >= config.target {
            return Ok(Some(Crossing { below, at: x, output: y }));
        }
        if x >= hi {
            return Ok(None);
        }
        below = Some(x);
        k += 1;
    }
}

fn validate_config(config: &SolveConfig) -> Result<(), ModelError> {
    let invalid = |msg: &str| Err(ModelError::InvalidSolverConfig(msg.to_string()));
    if config.input == config.output {
        return invalid("input and output must be different nodes");
    }
    if !config.lo.is_finite() || !config.hi.is_finite() || !config.target.is_finite() {
        return invalid("bounds and target must be finite");
    }
    if config.hi <= config.lo {
        return invalid("hi must be greater than lo");
    }
    if !config.step.is_finite() || config.step <= 0.0 {
        return invalid("step must be > 0");
    }
    if config.rounds == 0 {
        return invalid("rounds must be > 0");
    }
    if (config.hi - config.lo) / config.step > MAX_SWEEP_SAMPLES {
        return invalid("step is too small for the search range");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::graph::Value;
    use proptest::prelude::{prop_assert, proptest};

    fn assert_close(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() <= tol,
            "expected {expected}, got {actual}, tolerance {tol}"
        );
    }

    fn graph_with<F>(output: F) -> ComputationGraph
    where
        F: Fn(f64) -> f64 + 'static,
    {
        let mut graph = ComputationGraph::new();
        graph.register("x", 0.0);
        graph.register_fn("y", move |g| Ok(Value::Number(output(g.number("x")?))));
        graph
    }

    fn config(target: f64, lo: f64, hi: f64, step: f64, rounds: u32) -> SolveConfig {
        SolveConfig {
            input: "x".to_string(),
            output: "y".to_string(),
            target,
            lo,
            hi,
            step,
            rounds,
        }
    }

    #[test]
    fn finds_first_input_meeting_target_within_precision() {
        let mut graph = graph_with(|x| if x >= 3.7 { 1.0 } else { 0.0 });
        let result = solve_for(&mut graph, &config(0.5, 0.0, 10.0, 1.0, 3)).expect("must solve");

        assert_close(result.precision, 1e-3, 1e-12);
        assert!(result.solution >= 3.7);
        assert!(result.solution - 3.7 <= result.precision + 1e-9);
        assert_close(result.achieved_output, 1.0, 0.0);

        let steps: Vec<f64> = result.rounds.iter().map(|r| r.step).collect();
        assert_eq!(steps.len(), 4);
        for (actual, expected) in steps.iter().zip([1.0, 0.1, 0.01, 0.001]) {
            assert_close(*actual, expected, 1e-12);
        }
    }

    #[test]
    fn refines_continuous_crossing() {
        let mut graph = graph_with(|x| x * x * x);
        let result = solve_for(&mut graph, &config(10.0, 0.0, 5.0, 1.0, 4)).expect("must solve");
        let root = 10.0_f64.cbrt();
        assert!(result.solution >= root);
        assert!(result.solution - root <= 1e-4 + 1e-9);
        assert!(result.achieved_output >= 10.0);
    }

    #[test]
    fn keeps_first_of_several_crossings() {
        let mut graph = graph_with(|x| {
            if (2.0..3.0).contains(&x) || x >= 8.0 { 1.0 } else { 0.0 }
        });
        let result = solve_for(&mut graph, &config(0.5, 0.0, 10.0, 1.0, 2)).expect("must solve");
        assert_close(result.solution, 2.0, 1e-9);
    }

    #[test]
    fn returns_lower_bound_when_already_met() {
        let mut graph = graph_with(|_| 10.0);
        let result = solve_for(&mut graph, &config(5.0, 0.0, 10.0, 1.0, 3)).expect("must solve");
        assert_close(result.solution, 0.0, 0.0);
        assert_eq!(result.rounds.len(), 1);
        assert_close(result.precision, 1.0, 0.0);
    }

    #[test]
    fn reports_missing_crossing_and_restores_input() {
        let mut graph = graph_with(|x| x);
        let err = solve_for(&mut graph, &config(50.0, 0.0, 10.0, 1.0, 3))
            .expect_err("must fail");
        assert!(matches!(err, ModelError::SolverNoCrossingFound { .. }));
        assert!(!graph.is_overridden("x"));
        assert_close(graph.number("y").expect("y"), 0.0, 0.0);
    }

    #[test]
    fn restores_prior_override() {
        let mut graph = graph_with(|x| x);
        graph.override_node("x", 1.5).expect("override");
        solve_for(&mut graph, &config(4.0, 0.0, 10.0, 1.0, 1)).expect("must solve");
        assert_eq!(graph.override_value("x"), Some(&Value::Number(1.5)));
    }

    #[test]
    fn rejects_stale_input_outside_range() {
        let mut graph = graph_with(|x| x);
        graph.override_node("x", 50.0).expect("override");
        let err = solve_for(&mut graph, &config(4.0, 0.0, 10.0, 1.0, 1)).expect_err("must fail");
        assert!(matches!(err, ModelError::SolverInputOutOfRange { current, .. } if current == 50.0));
    }

    #[test]
    fn validates_config() {
        let mut graph = graph_with(|x| x);
        let cases = [
            config(1.0, 0.0, 10.0, 0.0, 1),
            config(1.0, 10.0, 10.0, 1.0, 1),
            config(1.0, 0.0, 10.0, 1.0, 0),
            config(1.0, 0.0, f64::INFINITY, 1.0, 1),
            config(1.0, 0.0, 1e9, 1.0, 1),
        ];
        for case in &cases {
            assert!(matches!(
                solve_for(&mut graph, case),
                Err(ModelError::InvalidSolverConfig(_))
            ));
        }

        let mut unknown = config(1.0, 0.0, 10.0, 1.0, 1);
        unknown.output = "missing".to_string();
        assert!(matches!(
            solve_for(&mut graph, &unknown),
            Err(ModelError::UnknownNode(_))
        ));
    }

    proptest! {
        #[test]
        fn solution_is_within_precision_of_threshold(
            threshold in 0.5f64..99.5,
            step in 1.0f64..10.0,
            rounds in 1u32..4,
        ) {
            let mut graph = graph_with(move |x| if x >= threshold { 1.0 } else { 0.0 });
            let result = solve_for(&mut graph, &config(0.5, 0.0, 100.0, step, rounds))
                .expect("threshold lies inside the range");
            prop_assert!(result.solution >= threshold);
            prop_assert!(result.solution - threshold <= result.precision + 1e-9);
            prop_assert!(!graph.is_overridden("x"));
        }
    }
}
