//! Hard ceiling on the number of trainable parameters.

use tracing::error;

use crate::TrainingError;

pub const DEFAULT_PARAMETER_CEILING: usize = 5_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterBudget {
    ceiling: usize,
}

impl ParameterBudget {
    pub fn new(ceiling: usize) -> Self {
        Self { ceiling }
    }

    /// Passes `total_params` through when it fits; a model exactly at the
    /// ceiling is accepted.
    pub fn check(&self, total_params: usize) -> Result<usize, TrainingError> {
        if total_params > self.ceiling {
            error!("===============================");
            error!(
                total_params,
                ceiling = self.ceiling,
                "total parameters exceed the budget"
            );
            error!("===============================");
            return Err(TrainingError::BudgetExceeded {
                total_params,
                ceiling: self.ceiling,
            });
        }
        Ok(total_params)
    }
}

impl Default for ParameterBudget {
    fn default() -> Self {
        Self::new(DEFAULT_PARAMETER_CEILING)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceiling_is_inclusive() {
        let budget = ParameterBudget::default();
        assert_eq!(budget.check(5_000_000).ok(), Some(5_000_000));
        let err = budget.check(5_000_001).unwrap_err();
        assert!(err.is_budget_rejection());
    }

    #[test]
    fn custom_ceiling() {
        let budget = ParameterBudget::new(10);
        assert!(budget.check(3).is_ok());
        assert!(matches!(
            budget.check(11),
            Err(TrainingError::BudgetExceeded {
                total_params: 11,
                ceiling: 10
            })
        ));
    }
}
