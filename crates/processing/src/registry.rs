use std::sync::Arc;

use thiserror::Error;

use mediagraph_core::JobKind;

use crate::processor::Processor;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("no processor registered for {0}")]
    Missing(JobKind),

    #[error("more than one processor registered for {0}")]
    Duplicate(JobKind),
}

/// Kind → processor mapping, complete for every [`JobKind`].
///
/// Built once at startup; [`ProcessorRegistryBuilder::build`] refuses to produce a
/// registry with a gap, so lookups never fail at run time.
#[derive(Clone)]
pub struct ProcessorRegistry {
    meta_to_scene_graph: Arc<dyn Processor>,
    retrieve_scene_graph: Arc<dyn Processor>,
}

impl ProcessorRegistry {
    pub fn builder() -> ProcessorRegistryBuilder {
        ProcessorRegistryBuilder::default()
    }

    pub fn get(&self, kind: JobKind) -> &dyn Processor {
        match kind {
            JobKind::MetaToSceneGraph => self.meta_to_scene_graph.as_ref(),
            JobKind::RetrieveSceneGraph => self.retrieve_scene_graph.as_ref(),
        }
    }
}

impl core::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("kinds", &JobKind::ALL)
            .finish()
    }
}

#[derive(Default)]
pub struct ProcessorRegistryBuilder {
    meta_to_scene_graph: Option<Arc<dyn Processor>>,
    retrieve_scene_graph: Option<Arc<dyn Processor>>,
    duplicate: Option<JobKind>,
}

impl ProcessorRegistryBuilder {
    /// Register a processor under the kind it reports.
    pub fn register<P: Processor>(self, processor: P) -> Self {
        self.register_arc(Arc::new(processor))
    }

    pub fn register_arc(mut self, processor: Arc<dyn Processor>) -> Self {
        let kind = processor.kind();
        let slot = match kind {
            JobKind::MetaToSceneGraph => &mut self.meta_to_scene_graph,
            JobKind::RetrieveSceneGraph => &mut self.retrieve_scene_graph,
        };
        if slot.replace(processor).is_some() && self.duplicate.is_none() {
            self.duplicate = Some(kind);
        }
        self
    }

    pub fn build(self) -> Result<ProcessorRegistry, RegistryError> {
        if let Some(kind) = self.duplicate {
            return Err(RegistryError::Duplicate(kind));
        }
        Ok(ProcessorRegistry {
            meta_to_scene_graph: self
                .meta_to_scene_graph
                .ok_or(RegistryError::Missing(JobKind::MetaToSceneGraph))?,
            retrieve_scene_graph: self
                .retrieve_scene_graph
                .ok_or(RegistryError::Missing(JobKind::RetrieveSceneGraph))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::processor::{FnProcessor, NoopCheckpoint};

    fn echo(kind: JobKind) -> impl Processor {
        FnProcessor::new(kind, move |input, _| Ok(json!({"kind": kind.as_str(), "input": input})))
    }

    #[test]
    fn dispatches_by_kind() {
        let registry = ProcessorRegistry::builder()
            .register(echo(JobKind::MetaToSceneGraph))
            .register(echo(JobKind::RetrieveSceneGraph))
            .build()
            .unwrap();

        for kind in JobKind::ALL {
            let out = registry.get(kind).process(&json!(1), &NoopCheckpoint).unwrap();
            assert_eq!(out["kind"], json!(kind.as_str()));
        }
    }

    #[test]
    fn missing_kind_is_rejected_at_build() {
        let err = ProcessorRegistry::builder()
            .register(echo(JobKind::MetaToSceneGraph))
            .build()
            .unwrap_err();
        assert_eq!(err, RegistryError::Missing(JobKind::RetrieveSceneGraph));
    }

    #[test]
    fn duplicate_kind_is_rejected_at_build() {
        let err = ProcessorRegistry::builder()
            .register(echo(JobKind::MetaToSceneGraph))
            .register(echo(JobKind::MetaToSceneGraph))
            .register(echo(JobKind::RetrieveSceneGraph))
            .build()
            .unwrap_err();
        assert_eq!(err, RegistryError::Duplicate(JobKind::MetaToSceneGraph));
    }
}
