use crate::campaign::{CampaignReport, Phase};
use crate::executor::ExecutionResult;
use crate::oracle::Verdict;
use std::io::Write;

/// Everything known about one finished execution.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionRecord<'a> {
    pub phase: Phase,
    /// `0` is the seed, `n` is the output of the `n`-th mutator (1-based).
    pub position: usize,
    pub mutator: Option<&'a str>,
    pub input: &'a str,
    pub result: &'a ExecutionResult,
    pub verdict: Verdict,
}

/// An `Observer` is notified by the campaign as it progresses.
///
/// Observers see every execution in order, including the one that halts a
/// campaign under the `halt` policy. An observer error aborts the campaign.
pub trait Observer {
    /// Identifies the observer in error messages.
    fn name(&self) -> &'static str;

    /// Called before the seed of `phase` runs; `inputs` counts the seed too.
    fn on_phase_start(&mut self, _phase: Phase, _inputs: usize) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn on_execution(&mut self, record: &ExecutionRecord<'_>) -> Result<(), anyhow::Error>;

    fn on_finish(&mut self, _report: &CampaignReport) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

/// Prints the exit status, raw input and raw output of every execution.
pub struct ConsoleObserver<W: Write> {
    out: W,
}

impl<W: Write> ConsoleObserver<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl ConsoleObserver<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write> Observer for ConsoleObserver<W> {
    fn name(&self) -> &'static str {
        "ConsoleObserver"
    }

    fn on_execution(&mut self, record: &ExecutionRecord<'_>) -> Result<(), anyhow::Error> {
        writeln!(self.out, "{}", record.result.status)?;
        writeln!(self.out, "Input: {}", record.input)?;
        writeln!(self.out, "Output: {}", record.result.output)?;
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutionStatus;
    use std::time::Duration;

    #[test]
    fn console_observer_prints_status_input_and_output() {
        let result = ExecutionResult {
            status: ExecutionStatus::Exited(0),
            output: "echoed\n".to_string(),
            elapsed: Duration::from_millis(3),
        };
        let record = ExecutionRecord {
            phase: Phase::Static,
            position: 1,
            mutator: Some("replace"),
            input: r#"a a="value">...</html>"#,
            result: &result,
            verdict: Verdict::Accepted,
        };

        let mut observer = ConsoleObserver::new(Vec::new());
        observer.on_execution(&record).unwrap();
        let printed = String::from_utf8(observer.into_inner()).unwrap();
        assert_eq!(
            printed,
            "Exit code: 0\nInput: a a=\"value\">...</html>\nOutput: echoed\n\n"
        );
    }

    #[test]
    fn console_observer_prints_timeouts() {
        let result = ExecutionResult {
            status: ExecutionStatus::TimedOut,
            output: String::new(),
            elapsed: Duration::from_secs(2),
        };
        let record = ExecutionRecord {
            phase: Phase::Dynamic,
            position: 0,
            mutator: None,
            input: "<a>",
            result: &result,
            verdict: Verdict::TimedOut,
        };

        let mut observer = ConsoleObserver::new(Vec::new());
        observer.on_execution(&record).unwrap();
        let printed = String::from_utf8(observer.into_inner()).unwrap();
        assert!(printed.starts_with("Timed out\nInput: <a>\n"));
    }
}
