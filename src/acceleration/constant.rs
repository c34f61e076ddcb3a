//! Constant under-relaxation.

use std::collections::BTreeMap;

use anyhow::{ensure, Result};
use nalgebra::DVector;

use super::{relax_all, Acceleration};
use crate::scheme::data::{DataId, DataMap};

/// Relaxes every iterate with a fixed factor:
/// `values <- omega * values + (1 - omega) * old_values.col(0)`.
pub struct ConstantRelaxation {
    relaxation: f64,
    data_ids: Vec<DataId>,
}

impl ConstantRelaxation {
    pub fn new(relaxation: f64, data_ids: Vec<DataId>) -> Result<Self> {
        ensure!(
            relaxation > 0.0 && relaxation <= 1.0,
            "relaxation factor for constant under-relaxation has to be \
             larger than zero and smaller or equal to one, got {relaxation}"
        );
        Ok(Self {
            relaxation,
            data_ids,
        })
    }

    pub fn relaxation_factor(&self) -> f64 {
        self.relaxation
    }
}

impl Acceleration for ConstantRelaxation {
    fn data_ids(&self) -> &[DataId] {
        &self.data_ids
    }

    fn initialize(&mut self, data: &mut DataMap) -> Result<()> {
        for id in &self.data_ids {
            ensure!(
                data.contains_key(id),
                "data with ID {id} is not contained in data given at initialization"
            );
        }
        for entry in data.values_mut() {
            entry.ensure_history_columns(1);
        }
        Ok(())
    }

    fn perform_acceleration(&mut self, data: &mut DataMap) -> Result<()> {
        relax_all(data, self.relaxation);
        Ok(())
    }

    fn iterations_converged(&mut self, _data: &mut DataMap) -> Result<()> {
        Ok(())
    }

    fn design_specification(&self, data: &DataMap) -> BTreeMap<DataId, DVector<f64>> {
        self.data_ids
            .iter()
            .map(|id| (*id, DVector::zeros(data[id].values.len())))
            .collect()
    }

    fn set_design_specification(&mut self, q: &DVector<f64>) -> Result<()> {
        ensure!(
            q.iter().all(|v| *v == 0.0),
            "a non-zero design specification is not supported by constant \
             under-relaxation"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheme::data::CouplingData;
    use approx::assert_relative_eq;

    #[test]
    fn test_relaxes_toward_old_values() {
        let mut acc = ConstantRelaxation::new(0.25, vec![0]).unwrap();
        let mut data = DataMap::new();
        data.insert(
            0,
            CouplingData::new(DVector::from_vec(vec![4.0, 8.0]), 1, 0, false),
        );
        acc.initialize(&mut data).unwrap();

        acc.perform_acceleration(&mut data).unwrap();
        // History is zero, so the relaxed value is omega * values.
        assert_relative_eq!(data[&0].values[0], 1.0);
        assert_relative_eq!(data[&0].values[1], 2.0);
    }

    #[test]
    fn test_rejects_invalid_factor() {
        assert!(ConstantRelaxation::new(0.0, vec![0]).is_err());
        assert!(ConstantRelaxation::new(1.01, vec![0]).is_err());
    }
}
