//! Quota and policy checks applied before anything is reserved.

use std::sync::Arc;

use tracing::debug;

use crate::{
    application::{
        collaborators::{CreationLimit, CreationPolicy, MapRegistry},
        error::ValidationError,
    },
    domain::entities::CreationRequest,
};

#[derive(Debug, Clone, Copy)]
pub struct ValidationLimits {
    pub max_map_area: u64,
    pub max_name_length: usize,
}

/// Runs the checks in a fixed order; the first failure wins. Only reads from collaborators.
#[derive(Clone)]
pub struct CreationValidator {
    limits: ValidationLimits,
    policy: Arc<dyn CreationPolicy>,
    registry: Arc<dyn MapRegistry>,
}

impl CreationValidator {
    pub fn new(
        limits: ValidationLimits,
        policy: Arc<dyn CreationPolicy>,
        registry: Arc<dyn MapRegistry>,
    ) -> Self {
        Self {
            limits,
            policy,
            registry,
        }
    }

    pub async fn validate(&self, request: &CreationRequest) -> Result<(), ValidationError> {
        check_request_shape(request, &self.limits)?;

        let area = request.dimensions.area();
        if area > self.limits.max_map_area {
            return Err(ValidationError::AreaExceeded {
                area,
                max: self.limits.max_map_area,
            });
        }

        if !self.policy.is_source_allowed(&request.source) {
            return Err(ValidationError::SourceNotAllowed {
                source_locator: request.source.to_string(),
            });
        }

        let Some(actor) = request.actor else {
            return Ok(());
        };

        if let limit @ CreationLimit::AtMost(max) = self.policy.creation_limit(actor) {
            let count = self
                .registry
                .count_by_owner(request.owner)
                .await
                .map_err(ValidationError::Lookup)?;
            if limit.is_reached(count) {
                debug!(
                    target = "application::validator",
                    owner = %request.owner,
                    actor = %actor,
                    count,
                    limit = max,
                    "creation limit reached"
                );
                return Err(ValidationError::LimitReached { limit: max });
            }
        }

        let existing = self
            .registry
            .list_by_owner(request.owner)
            .await
            .map_err(ValidationError::Lookup)?;
        if existing.iter().any(|map| map.name_matches(&request.name)) {
            return Err(ValidationError::DuplicateName {
                name: request.name.clone(),
            });
        }

        Ok(())
    }
}

fn check_request_shape(
    request: &CreationRequest,
    limits: &ValidationLimits,
) -> Result<(), ValidationError> {
    if request.dimensions.is_empty() {
        return Err(ValidationError::InvalidDimensions {
            width: request.dimensions.width,
            height: request.dimensions.height,
        });
    }

    let name = request.name.trim();
    if name.is_empty() {
        return Err(ValidationError::InvalidName {
            reason: "name must not be blank".to_string(),
        });
    }
    if name.chars().count() > limits.max_name_length {
        return Err(ValidationError::InvalidName {
            reason: format!(
                "name must be at most {} characters",
                limits.max_name_length
            ),
        });
    }

    Ok(())
}
