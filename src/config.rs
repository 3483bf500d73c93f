use std::fmt;
use wasmcore_environ::{Features, MAXIMUM_VALUES};

/// Global configuration options used to create a [`Store`](crate::Store) and
/// to build modules.
///
/// This structure exposes a builder-like interface. The default configuration
/// enables every feature of WebAssembly 2.0.
#[derive(Clone)]
pub struct Config {
    pub(crate) features: Features,
    pub(crate) max_function_types: u32,
    pub(crate) max_stack_values: u32,
}

impl Config {
    /// Creates a new configuration object with the WebAssembly 2.0 feature
    /// set enabled.
    pub fn new() -> Config {
        Config {
            features: Features::V2,
            max_function_types: MAXIMUM_VALUES,
            max_stack_values: MAXIMUM_VALUES,
        }
    }

    /// Creates a configuration with only the WebAssembly 1.0 feature set,
    /// which amounts to importing and exporting mutable globals.
    pub fn v1() -> Config {
        Config {
            features: Features::V1,
            ..Config::new()
        }
    }

    /// Returns the set of enabled WebAssembly features.
    pub fn features(&self) -> Features {
        self.features
    }

    /// Configures whether mutable globals may be imported and exported.
    ///
    /// This is `true` by default.
    pub fn wasm_mutable_global(&mut self, enable: bool) -> &mut Self {
        self.features.set(Features::MUTABLE_GLOBAL, enable);
        self
    }

    /// Configures whether the sign-extension operators (`i32.extend8_s` and
    /// friends) are valid.
    ///
    /// This is `true` by default.
    pub fn wasm_sign_extension(&mut self, enable: bool) -> &mut Self {
        self.features.set(Features::SIGN_EXTENSION_OPS, enable);
        self
    }

    /// Configures whether functions and blocks may return more than one
    /// value, and whether blocks may take parameters.
    ///
    /// This is `true` by default.
    pub fn wasm_multi_value(&mut self, enable: bool) -> &mut Self {
        self.features.set(Features::MULTI_VALUE, enable);
        self
    }

    /// Configures whether the saturating float-to-int conversions are valid.
    ///
    /// This is `true` by default.
    pub fn wasm_nontrapping_float_to_int(&mut self, enable: bool) -> &mut Self {
        self.features.set(Features::NONTRAPPING_FLOAT_TO_INT, enable);
        self
    }

    /// Configures whether the bulk memory instructions, passive segments and
    /// the data count section are valid.
    ///
    /// This is `true` by default.
    pub fn wasm_bulk_memory(&mut self, enable: bool) -> &mut Self {
        self.features.set(Features::BULK_MEMORY_OPERATIONS, enable);
        self
    }

    /// Configures whether the [WebAssembly reference types proposal][proposal]
    /// is enabled.
    ///
    /// This feature gates items such as the `externref` and `funcref` value
    /// types as well as allowing a module to define multiple tables. It also
    /// changes instantiation: out-of-bounds element and data segments no
    /// longer fail up front, the segments before them are still applied.
    ///
    /// This is `true` by default.
    ///
    /// [proposal]: https://github.com/webassembly/reference-types
    pub fn wasm_reference_types(&mut self, enable: bool) -> &mut Self {
        self.features.set(Features::REFERENCE_TYPES, enable);
        self
    }

    /// Configures whether the `v128` type and vector instructions are valid.
    ///
    /// This is `true` by default.
    pub fn wasm_simd(&mut self, enable: bool) -> &mut Self {
        self.features.set(Features::SIMD, enable);
        self
    }

    /// Limits the number of distinct function types a store will intern.
    ///
    /// Defaults to 2^27.
    pub fn max_function_types(&mut self, max: u32) -> &mut Self {
        self.max_function_types = max;
        self
    }

    /// Limits the operand stack height a function body may reach during
    /// validation.
    ///
    /// Defaults to 2^27.
    pub fn max_stack_values(&mut self, max: u32) -> &mut Self {
        self.max_stack_values = max;
        self
    }
}

impl Default for Config {
    fn default() -> Config {
        Config::new()
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Config")
            .field("features", &self.features.to_string())
            .field("max_function_types", &self.max_function_types)
            .field("max_stack_values", &self.max_stack_values)
            .finish()
    }
}
