//! Compensating actions for multi-step operations
//!
//! Each completed step of a cluster start records the action that undoes it.
//! On failure the recorded actions run newest first.

/// An action that undoes one completed step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compensation {
    /// Stop a VM started by this operation
    StopVm(String),
    /// Remove the definition of a VM created by this operation
    Deprovision(String),
}

/// Ordered list of compensating actions
#[derive(Debug, Default)]
pub struct Compensations {
    actions: Vec<Compensation>,
}

impl Compensations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the undo action for a step that just completed
    pub fn push(&mut self, action: Compensation) {
        self.actions.push(action);
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Consume the list, newest action first
    pub fn unwind(self) -> impl Iterator<Item = Compensation> {
        self.actions.into_iter().rev()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwind_runs_newest_first() {
        let mut comps = Compensations::new();
        assert!(comps.is_empty());

        comps.push(Compensation::Deprovision("hpc-controller".to_string()));
        comps.push(Compensation::Deprovision("hpc-compute-01".to_string()));
        comps.push(Compensation::StopVm("hpc-controller".to_string()));
        assert_eq!(comps.len(), 3);

        let order: Vec<_> = comps.unwind().collect();
        assert_eq!(
            order,
            vec![
                Compensation::StopVm("hpc-controller".to_string()),
                Compensation::Deprovision("hpc-compute-01".to_string()),
                Compensation::Deprovision("hpc-controller".to_string()),
            ]
        );
    }
}
