use std::io::{self, Write};

use serde::Serialize;

use crate::app::{SubmitResult, TaskReport};
use crate::planner::{Decision, ExecutionPlan};
use crate::tools::ToolInfo;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Human,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_plan(plan: &ExecutionPlan) -> io::Result<()> {
        Self::print_json(plan)
    }

    pub fn print_submissions(result: &SubmitResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_task(report: &TaskReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_tools(info: &ToolInfo) -> io::Result<()> {
        Self::print_json(info)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

/// One line per stage: `<stage> <run|skip> (<reason>)`.
pub fn render_plan(plan: &ExecutionPlan) -> String {
    let mut out = format!("samples: {}\n", plan.sample_count);
    for planned in &plan.stages {
        let decision = match planned.decision {
            Decision::Run => "run",
            Decision::Skip => "skip",
        };
        out.push_str(&format!(
            "{:<20} {decision:<4} ({})",
            planned.stage.as_str(),
            planned.reason
        ));
        if !planned.wait_on.is_empty() {
            let waits = planned
                .wait_on
                .iter()
                .map(|stage| stage.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            out.push_str(&format!(" after {waits}"));
        }
        out.push('\n');
    }
    out
}
