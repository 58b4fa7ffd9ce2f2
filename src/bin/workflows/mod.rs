mod check;
mod emulate;
mod shell;

pub(crate) use check::check;
pub(crate) use emulate::emulate;
pub(crate) use shell::shell;
