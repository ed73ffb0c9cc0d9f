//! `console.*` bridge: joins script arguments into one line and routes it to
//! the run's logger.
//!
//! Arguments arrive already rendered by the bootstrap script: strings as-is,
//! errors as `name: message`, anything else as cycle-safe compact JSON.

use crate::logger::Logger;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level {
    Verbose,
    Debug,
    Error,
}

impl Level {
    /// `log` and `warn` are user output; anything unknown is treated the same.
    pub fn from_method(method: &str) -> Self {
        match method {
            "debug" => Level::Debug,
            "error" => Level::Error,
            _ => Level::Verbose,
        }
    }
}

/// Emit one console line. Without a logger the line is dropped.
pub fn emit(logger: Option<&dyn Logger>, level: Level, parts: &[String]) {
    let Some(logger) = logger else {
        return;
    };
    let line = parts.join(" ");
    match level {
        Level::Verbose => logger.verbose(&line),
        Level::Debug => logger.debug(&line),
        Level::Error => logger.error(&line),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn levels() {
        assert_eq!(Level::from_method("log"), Level::Verbose);
        assert_eq!(Level::from_method("warn"), Level::Verbose);
        assert_eq!(Level::from_method("debug"), Level::Debug);
        assert_eq!(Level::from_method("error"), Level::Error);
    }

    #[derive(Default)]
    struct Capture(Mutex<Vec<(Level, String)>>);

    impl Logger for Capture {
        fn verbose(&self, msg: &str) {
            self.0.lock().unwrap().push((Level::Verbose, msg.into()));
        }
        fn debug(&self, msg: &str) {
            self.0.lock().unwrap().push((Level::Debug, msg.into()));
        }
        fn error(&self, msg: &str) {
            self.0.lock().unwrap().push((Level::Error, msg.into()));
        }
    }

    #[test]
    fn emit_routes_by_level() {
        let cap = Capture::default();
        emit(Some(&cap), Level::Error, &["boom".into(), "1".into()]);
        emit(Some(&cap), Level::Debug, &["x".into()]);
        emit(Some(&cap), Level::Verbose, &[]);
        emit(None, Level::Verbose, &["dropped".into()]);
        assert_eq!(
            *cap.0.lock().unwrap(),
            vec![
                (Level::Error, "boom 1".into()),
                (Level::Debug, "x".into()),
                (Level::Verbose, String::new()),
            ]
        );
    }
}
