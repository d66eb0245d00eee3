use std::collections::VecDeque;
use std::io::{self, BufRead, Write};

use crate::error::Result;
use crate::record::Record;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Label {
    Match,
    Distinct,
    Unsure,
    /// Stop labeling. Also how a label source cancels training.
    Finished,
}

/// A pair presented to the oracle.
pub struct LabelRequest<'a> {
    pub fields: &'a [String],
    pub left: &'a Record,
    pub right: &'a Record,
    pub positives: usize,
    pub negatives: usize,
}

///
/// Oracle answering whether two records denote the same entity. Calls block
/// until an answer exists.
///
pub trait LabelSource {
    fn label(&mut self, request: &LabelRequest<'_>) -> Result<Label>;
}

/// Asks a person at a terminal.
pub struct ConsoleLabeler<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> ConsoleLabeler<R, W> {
    pub fn new(input: R, output: W) -> Self {
        ConsoleLabeler { input, output }
    }

    fn show(&mut self, request: &LabelRequest<'_>) -> io::Result<()> {
        for record in [request.left, request.right] {
            for field in request.fields {
                writeln!(self.output, "{} : {}", field, record.get(field).unwrap_or(""))?;
            }
            writeln!(self.output)?;
        }
        writeln!(
            self.output,
            "{} positive, {} negative",
            request.positives, request.negatives
        )?;
        writeln!(self.output, "Do these records refer to the same thing?")?;
        write!(self.output, "(y)es / (n)o / (u)nsure / (f)inished ")?;
        self.output.flush()
    }
}

impl<R: BufRead, W: Write> LabelSource for ConsoleLabeler<R, W> {
    fn label(&mut self, request: &LabelRequest<'_>) -> Result<Label> {
        self.show(request)?;
        loop {
            let mut line = String::new();
            if self.input.read_line(&mut line)? == 0 {
                return Ok(Label::Finished);
            }
            match line.trim().to_lowercase().as_str() {
                "y" | "yes" => return Ok(Label::Match),
                "n" | "no" => return Ok(Label::Distinct),
                "u" | "unsure" => return Ok(Label::Unsure),
                "f" | "finished" => return Ok(Label::Finished),
                _ => {
                    write!(self.output, "Please enter y, n, u or f ")?;
                    self.output.flush()?;
                }
            }
        }
    }
}

/// Replays pre-recorded answers, then reports `Finished`.
#[derive(Clone, Debug, Default)]
pub struct ScriptedLabeler {
    answers: VecDeque<Label>,
    pub asked: usize,
}

impl ScriptedLabeler {
    pub fn new<I: IntoIterator<Item = Label>>(answers: I) -> Self {
        ScriptedLabeler {
            answers: answers.into_iter().collect(),
            asked: 0,
        }
    }
}

impl LabelSource for ScriptedLabeler {
    fn label(&mut self, _request: &LabelRequest<'_>) -> Result<Label> {
        self.asked += 1;
        Ok(self.answers.pop_front().unwrap_or(Label::Finished))
    }
}

/// Answers with a rule over the two records, up to `budget` questions.
pub struct RuleLabeler<F> {
    rule: F,
    budget: usize,
}

impl<F: FnMut(&Record, &Record) -> Label> RuleLabeler<F> {
    pub fn new(budget: usize, rule: F) -> Self {
        RuleLabeler { rule, budget }
    }
}

impl<F: FnMut(&Record, &Record) -> Label> LabelSource for RuleLabeler<F> {
    fn label(&mut self, request: &LabelRequest<'_>) -> Result<Label> {
        if self.budget == 0 {
            return Ok(Label::Finished);
        }
        self.budget -= 1;
        Ok((self.rule)(request.left, request.right))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records() -> (Vec<String>, Record, Record) {
        let fields = vec!["School".to_string()];
        let left = [("School", "Oakwood")].into_iter().collect();
        let right = [("School", "Oakwood High")].into_iter().collect();
        (fields, left, right)
    }

    #[test]
    fn console_reprompts_until_valid_answer() {
        let (fields, left, right) = records();
        let request = LabelRequest {
            fields: &fields,
            left: &left,
            right: &right,
            positives: 1,
            negatives: 2,
        };
        let mut output = Vec::new();
        let label = ConsoleLabeler::new("maybe\nY\n".as_bytes(), &mut output)
            .label(&request)
            .unwrap();
        assert_eq!(label, Label::Match);
        let shown = String::from_utf8(output).unwrap();
        assert!(shown.contains("School : oakwood high"));
        assert!(shown.contains("1 positive, 2 negative"));
        assert!(shown.contains("Please enter y, n, u or f"));
    }

    #[test]
    fn console_end_of_input_finishes() {
        let (fields, left, right) = records();
        let request = LabelRequest {
            fields: &fields,
            left: &left,
            right: &right,
            positives: 0,
            negatives: 0,
        };
        let label = ConsoleLabeler::new("".as_bytes(), Vec::new())
            .label(&request)
            .unwrap();
        assert_eq!(label, Label::Finished);
    }

    #[test]
    fn scripted_runs_out_into_finished() {
        let (fields, left, right) = records();
        let request = LabelRequest {
            fields: &fields,
            left: &left,
            right: &right,
            positives: 0,
            negatives: 0,
        };
        let mut labeler = ScriptedLabeler::new([Label::Distinct]);
        assert_eq!(labeler.label(&request).unwrap(), Label::Distinct);
        assert_eq!(labeler.label(&request).unwrap(), Label::Finished);
        assert_eq!(labeler.asked, 2);
    }

    #[test]
    fn rule_respects_budget() {
        let (fields, left, right) = records();
        let request = LabelRequest {
            fields: &fields,
            left: &left,
            right: &right,
            positives: 0,
            negatives: 0,
        };
        let mut labeler = RuleLabeler::new(1, |_, _| Label::Match);
        assert_eq!(labeler.label(&request).unwrap(), Label::Match);
        assert_eq!(labeler.label(&request).unwrap(), Label::Finished);
    }
}
