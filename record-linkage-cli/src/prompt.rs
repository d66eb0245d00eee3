use record_linkage_service::error::{LinkageError, Result};
use std::fs;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

/// The operator chose to leave instead of answering.
#[derive(Debug, PartialEq, Eq)]
pub struct Exit;

/// Terminal questions asked when a value was not given on the command line.
pub struct Prompter<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> Prompter<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Prompter { input, output }
    }

    pub fn into_inner(self) -> (R, W) {
        (self.input, self.output)
    }

    /// Next trimmed line, or `None` once input is closed.
    fn read_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim().to_string()))
    }

    fn ask(&mut self, question: &str) -> Result<Option<String>> {
        write!(self.output, "{question}")?;
        self.output.flush()?;
        self.read_line()
    }

    ///
    /// Numbered single-choice menu. Returns the zero-based index of the
    /// chosen option, asking again until the answer is in range.
    ///
    pub fn select(&mut self, title: &str, options: &[&str]) -> Result<std::result::Result<usize, Exit>> {
        writeln!(self.output, "{title}")?;
        for (number, option) in options.iter().enumerate() {
            writeln!(self.output, "{}. {option}", number + 1)?;
        }
        writeln!(self.output)?;
        let question = format!("Please enter selection [1-{}]: ", options.len());
        loop {
            let Some(answer) = self.ask(&question)? else {
                return Ok(Err(Exit));
            };
            match answer.parse::<usize>() {
                Ok(choice) if (1..=options.len()).contains(&choice) => return Ok(Ok(choice - 1)),
                _ => writeln!(self.output, "Invalid selection '{answer}'.")?,
            }
        }
    }

    pub fn yes_no(&mut self, question: &str) -> Result<std::result::Result<bool, Exit>> {
        loop {
            let Some(answer) = self.ask(&format!("{question} (y/n) "))? else {
                return Ok(Err(Exit));
            };
            match answer.to_lowercase().as_str() {
                "y" | "yes" => return Ok(Ok(true)),
                "n" | "no" => return Ok(Ok(false)),
                _ => {}
            }
        }
    }

    /// `Ok(())` to try again, `Err(Exit)` to leave.
    pub fn try_again(&mut self) -> Result<std::result::Result<(), Exit>> {
        loop {
            let Some(answer) = self.ask("Enter 't' to try again or 'e' to exit. ")? else {
                return Ok(Err(Exit));
            };
            match answer.to_lowercase().as_str() {
                "t" => return Ok(Ok(())),
                "e" => return Ok(Err(Exit)),
                _ => {}
            }
        }
    }

    ///
    /// Asks for a folder holding exactly one data file and returns that
    /// file. Problems are reported and the operator may retry or leave.
    ///
    pub fn data_file(&mut self, label: &str) -> Result<std::result::Result<PathBuf, Exit>> {
        loop {
            let Some(answer) = self.ask(&format!("Folder containing the {label} data: "))? else {
                return Ok(Err(Exit));
            };
            match resolve_data_file(Path::new(&answer)) {
                Ok(path) => return Ok(Ok(path)),
                Err(err) => {
                    writeln!(self.output, "[ERROR] {err}")?;
                    if let Err(exit) = self.try_again()? {
                        return Ok(Err(exit));
                    }
                }
            }
        }
    }
}

///
/// A file path is used as is; a folder must hold exactly one visible file.
///
pub fn resolve_data_file(path: &Path) -> Result<PathBuf> {
    if path.is_file() {
        return Ok(path.to_path_buf());
    }
    if !path.is_dir() {
        return Err(LinkageError::input(format!("could not find {}", path.display())));
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if entry.file_type()?.is_file() && !hidden {
            files.push(entry.path());
        }
    }
    match files.as_slice() {
        [file] => Ok(file.clone()),
        _ => Err(LinkageError::input(format!(
            "{} must contain a single data file, found {}",
            path.display(),
            files.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompter(answers: &str) -> Prompter<&[u8], Vec<u8>> {
        Prompter::new(answers.as_bytes(), Vec::new())
    }

    #[test]
    fn select_reasks_until_in_range() {
        let mut p = prompter("0\nthree\n2\n");
        assert_eq!(p.select("Mode", &["Dedup", "Link"]).unwrap(), Ok(1));
        let shown = String::from_utf8(p.output).unwrap();
        assert!(shown.contains("1. Dedup\n2. Link\n"));
        assert_eq!(shown.matches("Please enter selection [1-2]: ").count(), 3);
    }

    #[test]
    fn closed_input_means_exit() {
        assert_eq!(prompter("").yes_no("Train?").unwrap(), Err(Exit));
        assert_eq!(prompter("maybe\n").select("Mode", &["Dedup"]).unwrap(), Err(Exit));
    }

    #[test]
    fn yes_no_accepts_words_and_letters() {
        assert_eq!(prompter("YES\n").yes_no("Train?").unwrap(), Ok(true));
        assert_eq!(prompter("x\nn\n").yes_no("Train?").unwrap(), Ok(false));
    }

    #[test]
    fn folder_must_hold_one_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(resolve_data_file(dir.path()).is_err());
        fs::write(dir.path().join("schools.csv"), "name\n").unwrap();
        fs::write(dir.path().join(".DS_Store"), "").unwrap();
        assert_eq!(resolve_data_file(dir.path()).unwrap(), dir.path().join("schools.csv"));
        fs::write(dir.path().join("other.csv"), "name\n").unwrap();
        assert!(resolve_data_file(dir.path()).is_err());
    }

    #[test]
    fn bad_folder_offers_retry_then_exit() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let answers = format!("{}\ne\n", missing.display());
        let mut p = prompter(&answers);
        assert_eq!(p.data_file("school").unwrap(), Err(Exit));
        assert!(String::from_utf8(p.output).unwrap().contains("[ERROR] input error: could not find"));
    }
}
