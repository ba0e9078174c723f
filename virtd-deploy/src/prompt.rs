//! Interactive confirmation on the terminal.

use std::io::{BufRead, Write};
use std::sync::Mutex;
use virtd_hypervisor::Confirm;

/// Asks on stderr and reads the answer from a line source (stdin by default).
pub struct PromptConfirm<R> {
    input: Mutex<R>,
}

impl PromptConfirm<std::io::BufReader<std::io::Stdin>> {
    pub fn stdin() -> Self {
        Self::new(std::io::BufReader::new(std::io::stdin()))
    }
}

impl<R: BufRead> PromptConfirm<R> {
    pub fn new(input: R) -> Self {
        Self {
            input: Mutex::new(input),
        }
    }
}

/// `y`/`yes` in any case; everything else, including EOF, is a no.
pub fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

impl<R: BufRead + Send> Confirm for PromptConfirm<R> {
    fn confirm(&self, question: &str) -> bool {
        let mut stderr = std::io::stderr().lock();
        let _ = write!(stderr, "{} (y/N) ", question);
        let _ = stderr.flush();

        let mut answer = String::new();
        let mut input = match self.input.lock() {
            Ok(input) => input,
            Err(poisoned) => poisoned.into_inner(),
        };
        match input.read_line(&mut answer) {
            Ok(0) | Err(_) => false,
            Ok(_) => is_yes(&answer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_answers() {
        assert!(is_yes("y\n"));
        assert!(is_yes(" YES "));
        assert!(!is_yes(""));
        assert!(!is_yes("no"));
        assert!(!is_yes("yep"));
    }

    #[test]
    fn test_reads_one_line_per_question() {
        let prompt = PromptConfirm::new(Cursor::new("yes\nn\n"));
        assert!(prompt.confirm("destroy a?"));
        assert!(!prompt.confirm("destroy b?"));
        // EOF
        assert!(!prompt.confirm("destroy c?"));
    }
}
