//! Call-site macros.
//!
//! [`log!`](crate::log) and [`logf!`](crate::logf) compare the level against
//! [`STATIC_MIN_LEVEL`](crate::STATIC_MIN_LEVEL) in a branch the compiler can
//! fold away, so call sites below the compile-time threshold vanish entirely,
//! and both capture the enclosing function path for the event.

/// Path of the enclosing function, e.g. `my_crate::engine::start`.
#[macro_export]
macro_rules! function_path {
    () => {{
        fn marker() {}
        fn type_name_of<T>(_: T) -> &'static str {
            ::std::any::type_name::<T>()
        }
        let name = type_name_of(marker);
        name.strip_suffix("::marker").unwrap_or(name)
    }};
}

/// Submit a fixed message through the global [`logger()`](crate::logger).
///
/// ```
/// use logcourier::{log, subsystem, Level};
///
/// let sys = subsystem!("demo");
/// log!(Level::Info, sys, "hello");
/// ```
#[macro_export]
macro_rules! log {
    ($level:expr, $subsystem:expr, $message:expr) => {{
        let level = $level;
        if level >= $crate::STATIC_MIN_LEVEL {
            $crate::logger().log_from(level, $subsystem, $message, $crate::function_path!());
        }
    }};
}

/// Submit a formatted message through the global [`logger()`](crate::logger).
///
/// The message part accepts the full `format!` syntax:
///
/// ```
/// use logcourier::{logf, subsystem, Level};
///
/// let sys = subsystem!("demo");
/// logf!(Level::Fine, sys, "3 * 3 = {}", 3 * 3);
/// ```
#[macro_export]
macro_rules! logf {
    ($level:expr, $subsystem:expr, $($format:tt)+) => {{
        let level = $level;
        if level >= $crate::STATIC_MIN_LEVEL {
            $crate::logger().log_from(
                level,
                $subsystem,
                ::std::format!($($format)+),
                $crate::function_path!(),
            );
        }
    }};
}

/// Register a subsystem once and cache its handle at the call site.
///
/// Safe to use from any initialization order; the first evaluation registers
/// the name with the global logger, later ones reuse the handle.
#[macro_export]
macro_rules! subsystem {
    ($name:expr) => {{
        static SUBSYSTEM: ::std::sync::OnceLock<$crate::SubsystemId> =
            ::std::sync::OnceLock::new();
        *SUBSYSTEM.get_or_init(|| $crate::logger().register_subsystem($name))
    }};
}

#[cfg(test)]
mod tests {
    #[test]
    fn function_path_names_the_enclosing_function() {
        let path = crate::function_path!();
        assert!(path.ends_with("function_path_names_the_enclosing_function"), "got {path:?}");
        assert!(!path.ends_with("::marker"));
    }
}
