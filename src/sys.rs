use crate::call_context::Context;
use anyhow::Result;
use std::fmt;

/// A resource released when the module that owns it is closed.
pub trait Closer: Send + Sync {
    fn close(&self, ctx: &Context) -> Result<()>;
}

impl<F> Closer for F
where
    F: Fn(&Context) -> Result<()> + Send + Sync,
{
    fn close(&self, ctx: &Context) -> Result<()> {
        self(ctx)
    }
}

/// System resources handed to a module at instantiation: its arguments,
/// environment, and an open file table.
///
/// Closing the module closes the file table.
#[derive(Default)]
pub struct SysContext {
    args: Vec<String>,
    environ: Vec<(String, String)>,
    files: Option<Box<dyn Closer>>,
}

impl SysContext {
    pub fn new() -> SysContext {
        SysContext::default()
    }

    pub fn with_args<I, S>(mut self, args: I) -> SysContext
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> SysContext {
        self.environ.push((key.into(), value.into()));
        self
    }

    /// Sets the file table released when the module closes.
    pub fn with_files(mut self, files: impl Closer + 'static) -> SysContext {
        self.files = Some(Box::new(files));
        self
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn environ(&self) -> &[(String, String)] {
        &self.environ
    }

    pub(crate) fn close(&self, ctx: &Context) -> Result<()> {
        match &self.files {
            Some(files) => files.close(ctx),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for SysContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SysContext")
            .field("args", &self.args)
            .field("environ", &self.environ)
            .field("files", &self.files.is_some())
            .finish()
    }
}
