use crate::prelude::*;

/// Deduplicated status logging.
///
/// The control loops produce one status line per tick, most of them identical
/// to the previous one. A line is emitted at INFO when it changes and on every
/// tenth repeat, so a quiet installation does not flood the journal while a
/// changing one is still fully traceable.
#[derive(Default)]
pub struct StatusLog {
    last: Option<String>,
    repeats: u32,
}

impl StatusLog {
    const REPEAT_EVERY: u32 = 10;

    pub const fn new() -> Self {
        Self { last: None, repeats: 0 }
    }

    pub fn push(&mut self, line: String) {
        if self.last.as_deref() == Some(line.as_str()) {
            self.repeats += 1;
            if self.repeats.is_multiple_of(Self::REPEAT_EVERY) {
                info!("{line}");
            }
        } else {
            self.repeats = 0;
            info!("{line}");
            self.last = Some(line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeats_are_counted() {
        let mut log = StatusLog::new();
        log.push("a".to_string());
        log.push("a".to_string());
        assert_eq!(log.repeats, 1);
        log.push("b".to_string());
        assert_eq!(log.repeats, 0);
    }
}
