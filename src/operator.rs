//! Operator interaction.
//!
//! A few decisions need a person at the microscope: which camera to use when
//! none was configured, and confirmation before a long run. The session asks
//! through the [`Operator`] trait so tests can script the answers.

use std::collections::VecDeque;
use std::io::{self, BufRead, Write};

use tracing::warn;

/// Source of interactive decisions.
pub trait Operator: Send {
    /// Ask the operator to pick one of `options`.
    ///
    /// Returns the 1-based choice as typed, or `None` when the operator
    /// cancelled. Range checking is left to the caller.
    fn choose(&mut self, prompt: &str, options: &[String]) -> Option<usize>;
}

/// Prompts on stdout and reads the answer from stdin.
#[derive(Debug, Default)]
pub struct ConsoleOperator;

impl Operator for ConsoleOperator {
    fn choose(&mut self, prompt: &str, options: &[String]) -> Option<usize> {
        ask(io::stdin().lock(), io::stdout(), prompt, options)
    }
}

fn show_menu(output: &mut impl Write, prompt: &str, options: &[String]) -> io::Result<()> {
    writeln!(output, "{}", prompt)?;
    for (index, option) in options.iter().enumerate() {
        writeln!(output, "  {}: {}", index + 1, option)?;
    }
    write!(output, "> ")?;
    output.flush()
}

/// Show the menu on `output` and read one answer from `input`.
///
/// A menu that cannot be shown counts as cancelled.
fn ask(
    mut input: impl BufRead,
    mut output: impl Write,
    prompt: &str,
    options: &[String],
) -> Option<usize> {
    if let Err(e) = show_menu(&mut output, prompt, options) {
        warn!("Cannot show prompt '{}': {}", prompt, e);
        return None;
    }

    let mut line = String::new();
    match input.read_line(&mut line) {
        Ok(0) | Err(_) => None,
        Ok(_) => line.trim().parse().ok(),
    }
}

/// Replays pre-recorded answers. Runs out into `None`.
#[derive(Debug, Default)]
pub struct ScriptedOperator {
    answers: VecDeque<Option<usize>>,
    prompts: Vec<String>,
}

impl ScriptedOperator {
    /// Operator giving `answers` in order; `None` cancels that question.
    pub fn new(answers: impl IntoIterator<Item = Option<usize>>) -> Self {
        Self {
            answers: answers.into_iter().collect(),
            prompts: Vec::new(),
        }
    }

    /// Prompts seen so far.
    pub fn prompts(&self) -> &[String] {
        &self.prompts
    }
}

impl Operator for ScriptedOperator {
    fn choose(&mut self, prompt: &str, _options: &[String]) -> Option<usize> {
        self.prompts.push(prompt.to_string());
        self.answers.pop_front().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_operator_replays_answers_then_cancels() {
        let mut operator = ScriptedOperator::new([Some(2), None]);
        let options = vec!["Ceta".to_string(), "Falcon 4i".to_string()];

        assert_eq!(operator.choose("Camera?", &options), Some(2));
        assert_eq!(operator.choose("Camera?", &options), None);
        assert_eq!(operator.choose("Camera?", &options), None);
        assert_eq!(operator.prompts().len(), 3);
    }

    struct ClosedOutput;

    impl Write for ClosedOutput {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }
    }

    #[test]
    fn console_menu_reads_numbered_answer() {
        let options = vec!["Ceta".to_string(), "Falcon 4i".to_string()];
        let mut shown = Vec::new();

        let choice = ask(io::Cursor::new("2\n"), &mut shown, "Select camera", &options);

        assert_eq!(choice, Some(2));
        let shown = String::from_utf8(shown).unwrap();
        assert!(shown.contains("  2: Falcon 4i"));
    }

    #[test]
    fn unshowable_menu_is_cancelled() {
        let options = vec!["Ceta".to_string()];
        let choice = ask(io::Cursor::new("1\n"), ClosedOutput, "Select camera", &options);
        assert_eq!(choice, None);
    }
}
