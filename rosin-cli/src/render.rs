//! Terminal rendering of pipeline events.

use rosin_core::{PipelineEvent, StageBoard, VerificationSummary};
use std::io::{self, Write};

/// Writes events as they arrive, either formatted for humans or as JSON lines.
pub struct EventRenderer<W: Write> {
    out: W,
    json: bool,
    mid_line: bool,
    board: StageBoard,
}

impl<W: Write> EventRenderer<W> {
    pub fn new(out: W, json: bool) -> Self {
        Self {
            out,
            json,
            mid_line: false,
            board: StageBoard::new(),
        }
    }

    pub fn render(&mut self, event: &PipelineEvent) -> io::Result<()> {
        self.board.apply(event);
        if self.json {
            serde_json::to_writer(&mut self.out, event)?;
            writeln!(self.out)?;
            return self.out.flush();
        }

        match event {
            PipelineEvent::StageStart { stage, model } => {
                self.end_line()?;
                writeln!(self.out, "\n== Stage {stage}: {} ==", model.label())?;
            }
            PipelineEvent::StageContent { content, .. } => {
                write!(self.out, "{content}")?;
                self.mid_line = !content.ends_with('\n');
            }
            PipelineEvent::StageComplete { .. } => self.end_line()?,
            PipelineEvent::StageRetry {
                stage,
                model,
                attempt,
            } => {
                self.end_line()?;
                writeln!(
                    self.out,
                    "-- stage {stage}: attempt {attempt} with {} --",
                    model.label()
                )?;
            }
            PipelineEvent::StageSkipped { stage, error } => {
                self.end_line()?;
                writeln!(self.out, "!! stage {stage} skipped: {error}")?;
            }
            PipelineEvent::StageError { stage, error } => {
                self.end_line()?;
                writeln!(self.out, "!! stage {stage} failed: {error}")?;
            }
            PipelineEvent::Summary { summary } => {
                self.end_line()?;
                self.render_summary(summary)?;
            }
            PipelineEvent::Done => self.render_stage_recap()?,
        }
        self.out.flush()
    }

    /// One line per stage with the model that answered and how it ended.
    fn render_stage_recap(&mut self) -> io::Result<()> {
        writeln!(self.out, "\n== Stages ==")?;
        for stage in self.board.stages() {
            writeln!(
                self.out,
                "  {}. {:<40} {}",
                stage.stage,
                stage.model.label(),
                stage.status
            )?;
        }
        Ok(())
    }

    fn render_summary(&mut self, summary: &VerificationSummary) -> io::Result<()> {
        let source = if summary.is_analyzed {
            "model analysis"
        } else {
            "heuristic"
        };
        writeln!(self.out, "\n== Verification summary ({source}) ==")?;
        writeln!(self.out, "Consistency:    {}", summary.consistency)?;
        writeln!(self.out, "Hallucinations: {}", summary.hallucinations)?;
        writeln!(self.out, "Confidence:     {}", summary.confidence)?;
        if !summary.contradictions.is_empty() {
            writeln!(self.out, "Contradictions:")?;
            for c in &summary.contradictions {
                writeln!(
                    self.out,
                    "  - {} (stage {} vs {}): {}",
                    c.topic, c.stage_a, c.stage_b, c.description
                )?;
            }
        }
        Ok(())
    }

    fn end_line(&mut self) -> io::Result<()> {
        if self.mid_line {
            writeln!(self.out)?;
            self.mid_line = false;
        }
        Ok(())
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.out
    }
}
