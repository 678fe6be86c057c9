use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use super::backend::{Classifier, FaceBackend};

/// Thread-safe registry of detection backends, keyed by name.
///
/// Backend choice is a configuration-time decision: the pipeline asks for
/// its configured backend by name and never hard-codes an implementation.
/// Backends are wrapped in `Mutex` because their methods take `&mut self`.
pub struct BackendRegistry {
    faces: HashMap<String, Arc<Mutex<dyn FaceBackend>>>,
    classifiers: HashMap<String, Arc<Mutex<dyn Classifier>>>,
    default_face: Option<String>,
    default_classifier: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            faces: HashMap::new(),
            classifiers: HashMap::new(),
            default_face: None,
            default_classifier: None,
        }
    }

    /// Registry preloaded with the always-available stub backends.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_face(super::backends::StubFaceBackend::new());
        registry.register_classifier(super::backends::StubClassifier::new());
        registry
    }

    /// Register a face backend. The first registered becomes the default.
    pub fn register_face<B: FaceBackend + 'static>(&mut self, backend: B) {
        let name = backend.name().to_string();
        if self.default_face.is_none() {
            self.default_face = Some(name.clone());
        }
        self.faces.insert(name, Arc::new(Mutex::new(backend)));
    }

    /// Register a classifier. The first registered becomes the default.
    pub fn register_classifier<C: Classifier + 'static>(&mut self, backend: C) {
        let name = backend.name().to_string();
        if self.default_classifier.is_none() {
            self.default_classifier = Some(name.clone());
        }
        self.classifiers.insert(name, Arc::new(Mutex::new(backend)));
    }

    /// Face backend by name, falling back to the default for "".
    pub fn face(&self, name: &str) -> Result<Arc<Mutex<dyn FaceBackend>>> {
        let name = if name.is_empty() {
            self.default_face
                .as_deref()
                .ok_or_else(|| anyhow!("no face backend registered"))?
        } else {
            name
        };
        self.faces
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("face backend '{}' not registered", name))
    }

    /// Classifier by name, falling back to the default for "".
    pub fn classifier(&self, name: &str) -> Result<Arc<Mutex<dyn Classifier>>> {
        let name = if name.is_empty() {
            self.default_classifier
                .as_deref()
                .ok_or_else(|| anyhow!("no classifier registered"))?
        } else {
            name
        };
        self.classifiers
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("classifier '{}' not registered", name))
    }

    /// Registered face backend names.
    pub fn face_names(&self) -> Vec<String> {
        self.faces.keys().cloned().collect()
    }

    /// Registered classifier names.
    pub fn classifier_names(&self) -> Vec<String> {
        self.classifiers.keys().cloned().collect()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_resolve_by_name_and_default() {
        let registry = BackendRegistry::with_builtins();
        assert!(registry.face("stub").is_ok());
        assert!(registry.face("").is_ok());
        assert!(registry.classifier("stub").is_ok());
        assert!(registry.face("mtcnn").is_err());
    }
}
