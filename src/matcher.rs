//! Binds a declared container to the one the engine already knows about
//!
//! Selection is last-match-wins: every container satisfying the image,
//! command and name checks replaces the previous pick, so with duplicates the
//! one listed last by the engine is the one acted on.

use crate::config::DesiredContainerSpec;
use crate::container::{ObservedContainer, ResolvedContainer};
use crate::engine::EngineClient;
use crate::{Error, Result};

/// Whether `observed` satisfies the image, command and name checks
pub fn matches(spec: &DesiredContainerSpec, observed: &ObservedContainer) -> bool {
    image_matches(spec, observed) && command_matches(spec, observed) && name_matches(spec, observed)
}

fn image_matches(spec: &DesiredContainerSpec, observed: &ObservedContainer) -> bool {
    observed.image_id.contains(&spec.image) || observed.image_name.contains(&spec.image)
}

fn command_matches(spec: &DesiredContainerSpec, observed: &ObservedContainer) -> bool {
    spec.command.as_deref().map_or(true, |cmd| observed.command == cmd)
}

fn name_matches(spec: &DesiredContainerSpec, observed: &ObservedContainer) -> bool {
    spec.container_name.as_deref().map_or(true, |name| observed.name == name)
}

/// Pick the matching container from an already fetched list
pub fn select(spec: &DesiredContainerSpec, observed: &[ObservedContainer]) -> ResolvedContainer {
    let mut selected: Option<&ObservedContainer> = None;
    let mut hits = 0usize;

    for container in observed.iter().filter(|c| matches(spec, c)) {
        tracing::debug!(
            container = %container.id,
            image_id = %container.image_id,
            command = %container.command,
            name = %container.name,
            "Matched container"
        );
        hits += 1;
        selected = Some(container);
    }

    if hits > 1 {
        if let Some(chosen) = selected {
            tracing::warn!(
                image = %spec.image,
                matches = hits,
                chosen = %chosen.id,
                "Several containers match, using the last one listed"
            );
        }
    }

    selected.cloned().map_or_else(ResolvedContainer::absent, ResolvedContainer::found)
}

/// List every container the engine knows and select the match
pub fn scan<E: EngineClient + ?Sized>(engine: &E, spec: &DesiredContainerSpec) -> Result<ResolvedContainer> {
    let ids = engine
        .list_all()
        .map_err(|e| Error::engine_call("list", "", e))?;

    let mut observed = Vec::with_capacity(ids.len());
    for id in ids {
        match engine.get(&id) {
            Ok(container) => observed.push(container),
            // removed between list and inspect
            Err(crate::error::EngineError::NotFound(_)) => {
                tracing::debug!(container = %id, "Container vanished during scan");
            }
            Err(e) => return Err(Error::engine_call("inspect", id, e)),
        }
    }

    Ok(select(spec, &observed))
}
