use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ToastVariant {
    #[default]
    Default,
    Destructive,
}

/// A transient, user-visible notification.
#[derive(Clone, Debug, PartialEq)]
pub struct Toast {
    pub title: String,
    pub description: String,
    pub variant: ToastVariant,
    pub duration: Option<Duration>,
}

impl Toast {
    pub fn info(title: &str, description: impl Into<String>) -> Self {
        Toast {
            title: title.to_string(),
            description: description.into(),
            variant: ToastVariant::Default,
            duration: None,
        }
    }

    pub fn error(title: &str, description: impl Into<String>) -> Self {
        Toast {
            variant: ToastVariant::Destructive,
            ..Toast::info(title, description)
        }
    }

    pub fn lasting(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }
}

/// Presentation surface for toasts. Fire and forget.
pub trait Toaster: Send + Sync {
    fn toast(&self, toast: Toast);
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    pub struct RecordingToaster {
        toasts: Arc<Mutex<Vec<Toast>>>,
    }

    impl RecordingToaster {
        pub fn titles(&self) -> Vec<String> {
            self.toasts.lock().unwrap().iter().map(|t| t.title.clone()).collect()
        }

        pub fn all(&self) -> Vec<Toast> {
            self.toasts.lock().unwrap().clone()
        }

        pub fn count(&self, title: &str) -> usize {
            self.toasts.lock().unwrap().iter().filter(|t| t.title == title).count()
        }
    }

    impl Toaster for RecordingToaster {
        fn toast(&self, toast: Toast) {
            self.toasts.lock().unwrap().push(toast);
        }
    }
}
