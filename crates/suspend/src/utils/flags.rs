//! A small library to parse command-line and environmental flags.
//!
//! Flags are grouped by a marker type and registered before `main` runs through
//! [`define_flag!`](crate::define_flag), so any crate linked into the binary can
//! contribute its own group. A group is parsed once; values are afterwards read
//! through the generated accessors.

use std::{
    any::TypeId,
    borrow::Cow,
    sync::atomic::{AtomicBool, Ordering},
};

use parking_lot::Mutex;

/// Parses a textual flag argument and stores it. Returns `false` if the text
/// is not a valid value for the flag.
pub type FlagSetter = fn(&str) -> bool;

pub struct Flag {
    name: &'static str,
    comment: &'static str,
    is_set: AtomicBool,
    setter: FlagSetter,
    is_bool: bool,
}

impl Flag {
    pub const fn new(
        name: &'static str,
        comment: &'static str,
        setter: FlagSetter,
        is_bool: bool,
    ) -> Self {
        Self {
            name,
            comment,
            is_set: AtomicBool::new(false),
            setter,
            is_bool,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn comment(&self) -> &'static str {
        self.comment
    }

    pub fn is_set(&self) -> bool {
        self.is_set.load(Ordering::Relaxed)
    }

    fn set_from_str(&self, argument: &str) -> bool {
        if (self.setter)(argument) {
            self.is_set.store(true, Ordering::Relaxed);
            true
        } else {
            false
        }
    }
}

struct FlagGroup {
    type_id: TypeId,
    flags: Vec<&'static Flag>,
    initialized: bool,
}

/// Registered groups. Filled from constructors, before `main`.
static GROUPS: Mutex<Vec<FlagGroup>> = Mutex::new(Vec::new());

/// Values that can be stored in a flag.
pub trait FlagValue: Sized {
    const IS_BOOL: bool = false;
    fn parse_flag(argument: &str) -> Option<Self>;
}

impl FlagValue for bool {
    const IS_BOOL: bool = true;

    fn parse_flag(argument: &str) -> Option<Self> {
        match argument {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        }
    }
}

fn split_radix(argument: &str) -> (&str, u32) {
    if argument.len() > 2 && &argument[0..2] == "0x" {
        (&argument[2..], 16)
    } else if argument.len() > 1 && &argument[0..1] == "0" {
        (&argument[1..], 8)
    } else {
        (argument, 10)
    }
}

macro_rules! integer_flag_value {
    ($($t: ty),*) => {
        $(
            impl FlagValue for $t {
                fn parse_flag(argument: &str) -> Option<Self> {
                    let (digits, radix) = split_radix(argument);
                    <$t>::from_str_radix(digits, radix).ok()
                }
            }
        )*
    };
}

integer_flag_value!(usize, isize, u32, u64, i64);

impl FlagValue for f64 {
    fn parse_flag(argument: &str) -> Option<Self> {
        argument.parse().ok()
    }
}

impl FlagValue for String {
    fn parse_flag(argument: &str) -> Option<Self> {
        Some(argument.to_owned())
    }
}

pub struct FlagsOf<T>(std::marker::PhantomData<T>);

impl<T: 'static> FlagsOf<T> {
    fn with_group<U>(f: impl FnOnce(&mut FlagGroup) -> U) -> U {
        let mut groups = GROUPS.lock();
        let key = TypeId::of::<T>();
        let ix = match groups.iter().position(|group| group.type_id == key) {
            Some(ix) => ix,
            None => {
                groups.push(FlagGroup {
                    type_id: key,
                    flags: Vec::new(),
                    initialized: false,
                });
                groups.len() - 1
            }
        };

        f(&mut groups[ix])
    }

    fn lookup(name: &str) -> Option<&'static Flag> {
        Self::with_group(|group| group.flags.iter().copied().find(|flag| flag.name == name))
    }

    pub fn is_set(name: &str) -> bool {
        Self::lookup(name).map_or(false, Flag::is_set)
    }

    /// All flags of this group, in registration order.
    pub fn flags() -> Vec<&'static Flag> {
        Self::with_group(|group| group.flags.clone())
    }

    fn parse_option(option: &str) -> Result<(), FlagError> {
        let (name, argument) = match option.find('=') {
            Some(pos) => (&option[..pos], Cow::Borrowed(&option[pos + 1..])),
            None => (option, Cow::Borrowed("true")),
        };
        let name = name.replace('-', "_");

        let (flag, argument) = match Self::lookup(&name) {
            Some(flag) => (flag, argument),
            None => {
                // `no_foo` / `no-foo` switch a boolean flag off.
                let negated = name
                    .strip_prefix("no_")
                    .and_then(Self::lookup)
                    .filter(|flag| flag.is_bool && argument == "true");
                match negated {
                    Some(flag) => (flag, Cow::Borrowed("false")),
                    None => return Err(FlagError::FlagNotFound(name)),
                }
            }
        };

        if !flag.set_from_str(&argument) {
            log::warn!(
                target: "vmkit::flags",
                "Ignoring flag: {} is an invalid value for flag {}",
                argument,
                flag.name
            );
        }

        Ok(())
    }

    fn process_command_line_flags(
        prefix: Option<&str>,
        args: impl Iterator<Item = String>,
    ) -> Result<(), FlagError> {
        let cli_prefix = prefix
            .map(|prefix| Cow::Owned(format!("--{}:", prefix)))
            .unwrap_or(Cow::Borrowed("--"));

        let mut args = args.collect::<Vec<_>>();
        args.sort();

        for arg in args.iter() {
            if let Some(option) = arg.strip_prefix(&*cli_prefix).filter(|o| !o.is_empty()) {
                Self::parse_option(option)?;
            }
        }

        Ok(())
    }

    fn process_environmental_vars(
        prefix: Option<&str>,
        vars: impl Iterator<Item = (String, String)>,
    ) {
        let env_prefix = prefix
            .map(|prefix| format!("{}_", prefix.to_uppercase()))
            .unwrap_or_default();

        for (var, argument) in vars {
            let Some(name) = var.strip_prefix(&env_prefix) else {
                continue;
            };

            let name = name.to_lowercase();
            if let Some(flag) = Self::lookup(&name) {
                if !flag.set_from_str(&argument) {
                    log::warn!(
                        target: "vmkit::flags",
                        "Ignoring flag: {} is an invalid value for flag {}",
                        argument,
                        name
                    );
                }
            }
        }
    }
}

fn parse_group<T: 'static>(
    prefix: Option<&str>,
    args: impl Iterator<Item = String>,
    env: impl Iterator<Item = (String, String)>,
) -> Result<(), FlagError> {
    let state = {
        let groups = GROUPS.lock();
        groups
            .iter()
            .find(|group| group.type_id == TypeId::of::<T>())
            .map(|group| group.initialized)
    };

    match state {
        None => Err(FlagError::NoFlags(std::any::type_name::<T>())),
        Some(true) => Err(FlagError::FlagsAlreadyInitialized(
            std::any::type_name::<T>(),
        )),
        Some(false) => {
            // environment first, so the command line wins
            FlagsOf::<T>::process_environmental_vars(prefix, env);
            FlagsOf::<T>::process_command_line_flags(prefix, args)?;
            FlagsOf::<T>::with_group(|group| group.initialized = true);
            Ok(())
        }
    }
}

pub fn parse<T: 'static>(
    args: impl Iterator<Item = String>,
    env: impl Iterator<Item = (String, String)>,
) -> Result<(), FlagError> {
    parse_group::<T>(None, args, env)
}

/// Parse flags of group `T` given as `--prefix:name=value` or `PREFIX_NAME=value`.
pub fn parse_with_prefix<T: 'static>(
    prefix: &str,
    args: impl Iterator<Item = String>,
    env: impl Iterator<Item = (String, String)>,
) -> Result<(), FlagError> {
    parse_group::<T>(Some(prefix), args, env)
}

#[doc(hidden)]
pub fn register<T: 'static>(flag: &'static Flag) {
    FlagsOf::<T>::with_group(|group| {
        if group.flags.iter().all(|f| f.name != flag.name) {
            group.flags.push(flag);
        }
    });
}

#[doc(hidden)]
pub use ctor;
#[doc(hidden)]
pub use parking_lot::RwLock;
#[doc(hidden)]
pub use paste;

/// Defines a flag in group `$of`.
///
/// Generates `<of>_<name>()` to read the value, `set_<of>_<name>()` to override
/// it and `is_<of>_<name>_set()` to check whether it was given explicitly.
#[macro_export]
macro_rules! define_flag {
    ($of: ident => $typ: ty, $name: ident, $default_value: expr, $comment: literal) => {
        $crate::utils::flags::paste::paste! {
            static [<$of:upper _FLAG_ $name:upper>]: $crate::utils::flags::RwLock<$typ> =
                $crate::utils::flags::RwLock::new($default_value);

            static [<$of:upper _FLAG_ $name:upper _META>]: $crate::utils::flags::Flag =
                $crate::utils::flags::Flag::new(
                    stringify!($name),
                    $comment,
                    |argument| {
                        match <$typ as $crate::utils::flags::FlagValue>::parse_flag(argument) {
                            Some(value) => {
                                *[<$of:upper _FLAG_ $name:upper>].write() = value;
                                true
                            }
                            None => false,
                        }
                    },
                    <$typ as $crate::utils::flags::FlagValue>::IS_BOOL,
                );

            #[doc(hidden)]
            #[$crate::utils::flags::ctor::ctor]
            fn [<init_ $of:lower _ $name _flag>]() {
                $crate::utils::flags::register::<$of>(&[<$of:upper _FLAG_ $name:upper _META>]);
            }

            #[allow(dead_code)]
            pub fn [<$of:lower _ $name>]() -> $typ {
                [<$of:upper _FLAG_ $name:upper>].read().clone()
            }

            #[allow(dead_code)]
            pub fn [<set_ $of:lower _ $name>]($name: $typ) {
                *[<$of:upper _FLAG_ $name:upper>].write() = $name;
            }

            #[allow(dead_code)]
            pub fn [<is_ $of:lower _ $name _set>]() -> bool {
                $crate::utils::flags::FlagsOf::<$of>::is_set(stringify!($name))
            }
        }
    };
}

#[derive(Debug, thiserror::Error)]
pub enum FlagError {
    #[error("unknown flag: {0}")]
    FlagNotFound(String),
    #[error("flags of {0} were already parsed")]
    FlagsAlreadyInitialized(&'static str),
    #[error("no flags registered for {0}")]
    NoFlags(&'static str),
}
