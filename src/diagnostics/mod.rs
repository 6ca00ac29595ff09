//! Concrete diagnostics.
//!
//! Each diagnostic is a fixed script over the session primitives. Results
//! are logged; they are also kept on the diagnostic value so callers and
//! tests can inspect them after [`run`](crate::lifecycle::run).

pub mod afis;
pub mod eucentricity;
pub mod stage_drift;

pub use afis::Afis;
pub use eucentricity::Eucentricity;
pub use stage_drift::StageDrift;

use crate::lifecycle::Diagnostic;
use crate::profiles::TestId;

/// Diagnostic implementing `test`, if this tool has one.
pub fn for_test(test: TestId) -> Option<Box<dyn Diagnostic>> {
    match test {
        TestId::StageDrift => Some(Box::new(StageDrift::default())),
        TestId::Eucentricity => Some(Box::new(Eucentricity::default())),
        TestId::Afis => Some(Box::new(Afis::default())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn implemented_diagnostics() {
        assert_eq!(
            for_test(TestId::StageDrift).map(|d| d.name().to_string()),
            Some("Stage drift".to_string())
        );
        assert!(for_test(TestId::Eucentricity).is_some());
        assert_eq!(
            for_test(TestId::Afis).map(|d| d.name().to_string()),
            Some("AFIS".to_string())
        );
        assert!(for_test(TestId::ThonRings).is_none());
    }
}
