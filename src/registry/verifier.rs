//! Admission verifier: validation followed by registry-based authorization.

use super::{ProducerInfo, ProducerRegistry};
use crate::error::{ArbiterResult, AuthorizationError};
use crate::instruction::{self, Instruction};
use std::sync::Arc;

/// Runs structural validation and then checks the producer against the
/// registry. Pure: it never mutates anything, so it is safe to call
/// speculatively before deciding to enqueue.
#[derive(Debug, Clone)]
pub struct Verifier {
    registry: Arc<ProducerRegistry>,
}

impl Verifier {
    pub fn new(registry: Arc<ProducerRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ProducerRegistry> {
        &self.registry
    }

    /// Verify an instruction and return the producer that submitted it.
    pub fn verify(&self, instruction: &Instruction) -> ArbiterResult<&ProducerInfo> {
        instruction::validate(instruction)?;

        let producer_id = instruction
            .producer_id()
            .ok_or(AuthorizationError::MissingProducerId)?;

        let producer = self
            .registry
            .get(producer_id.as_str())
            .ok_or_else(|| AuthorizationError::UnknownProducer(producer_id.clone()))?;

        if !producer.may_issue(instruction.kind()) {
            return Err(AuthorizationError::KindNotPermitted {
                producer: producer.id.clone(),
                kind: instruction.kind(),
            }
            .into());
        }

        Ok(producer)
    }
}
