//! Template rendering against the manager's cache.
//!
//! The engine stringifies errors raised by template functions, so the
//! not-ready outcome travels as a marker message and is matched back out of
//! the error chain here.

use minijinja::value::Value;
use minijinja::{context, Environment, ErrorKind};

use crate::error::{Error, Result};
use crate::manager::{Manager, QueryError, NOT_READY_MARKER};

/// Outcome of a render attempt.
#[derive(Debug)]
pub enum Rendered {
    /// The fully rendered output.
    Ready(String),
    /// A referenced key has no snapshot yet; try again on the next tick.
    NotReady,
}

#[derive(Debug)]
pub struct Renderer {
    env: Environment<'static>,
    source: String,
}

impl Renderer {
    /// Builds the template environment, binding `endpoints` and `pods` to
    /// the manager, and validates the template syntax.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the source is not a valid template.
    pub fn new(manager: Manager, source: String) -> Result<Self> {
        let mut env = Environment::new();

        let endpoints_manager = manager.clone();
        env.add_function(
            "endpoints",
            move |namespace: String, name: String| -> std::result::Result<Value, minijinja::Error> {
                endpoints_manager
                    .endpoints(&namespace, &name)
                    .map(|endpoints| Value::from_serialize(&endpoints))
                    .map_err(function_error)
            },
        );

        let pods_manager = manager;
        env.add_function(
            "pods",
            move |namespace: String, selector: String| -> std::result::Result<Value, minijinja::Error> {
                pods_manager
                    .pods_by_labels(&namespace, &selector)
                    .map(|pods| Value::from_serialize(&pods))
                    .map_err(function_error)
            },
        );

        if let Err(error) = env.template_from_str(&source) {
            return Err(Error::TemplateSyntax(error));
        }
        Ok(Self { env, source })
    }

    /// Renders the template against the current cache state.
    ///
    /// # Errors
    ///
    /// Will return `Err` for any evaluation failure other than the
    /// not-ready outcome.
    pub fn render(&self) -> Result<Rendered> {
        let template = self
            .env
            .template_from_str(&self.source)
            .map_err(Error::TemplateSyntax)?;
        match template.render(context! {}) {
            Ok(output) => Ok(Rendered::Ready(output)),
            Err(error) if is_not_ready(&error) => Ok(Rendered::NotReady),
            Err(error) => Err(Error::TemplateRender(error)),
        }
    }
}

fn function_error(error: QueryError) -> minijinja::Error {
    minijinja::Error::new(ErrorKind::InvalidOperation, error.to_string())
}

fn is_not_ready(error: &minijinja::Error) -> bool {
    let mut current: Option<&dyn std::error::Error> = Some(error);
    while let Some(error) = current {
        if error.to_string().contains(NOT_READY_MARKER) {
            return true;
        }
        current = error.source();
    }
    false
}
