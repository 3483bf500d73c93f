//! The operand-type stack tracked while validating a function body.

use crate::ValType;
use core::fmt;
use smallvec::SmallVec;

/// A value on the operand-type stack.
///
/// `Unknown` only appears after stack-polymorphic instructions such as `br`
/// or `unreachable`, and matches any expected type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operand {
    Known(ValType),
    Unknown,
}

impl Operand {
    pub(crate) fn matches(self, other: Operand) -> bool {
        self == other || self == Operand::Unknown || other == Operand::Unknown
    }

    pub(crate) fn is_ref(self) -> bool {
        matches!(self, Operand::Known(ty) if ty.is_ref())
    }
}

impl From<ValType> for Operand {
    fn from(ty: ValType) -> Operand {
        Operand::Known(ty)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Known(ty) => ty.fmt(f),
            Operand::Unknown => f.write_str("unknown"),
        }
    }
}

fn describe(types: impl IntoIterator<Item = Operand>) -> String {
    types
        .into_iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Reports a mismatch between the number of values available and wanted.
pub(crate) fn type_count_error(
    is_param: bool,
    context: &str,
    have: &[Operand],
    want: &[ValType],
) -> String {
    let mut ret = String::from(if have.len() > want.len() {
        "too many "
    } else {
        "not enough "
    });
    ret.push_str(if is_param { "params" } else { "results" });
    if !context.is_empty() {
        if is_param {
            ret.push_str(&format!(" for {context} block"));
        } else {
            ret.push_str(&format!(" in {context} block"));
        }
    }
    format!(
        "{ret}\n\thave ({})\n\twant ({})",
        describe(have.iter().copied()),
        describe(want.iter().map(|&t| Operand::Known(t))),
    )
}

fn type_mismatch_error(
    is_param: bool,
    context: &str,
    have: Operand,
    want: ValType,
    index: usize,
) -> String {
    let kind = if is_param { "param" } else { "result" };
    if context.is_empty() {
        format!("cannot use {have} as {kind}[{index}] type {want}")
    } else {
        format!("cannot use {have} in {context} block as {kind}[{index}] type {want}")
    }
}

#[derive(Default)]
pub(crate) struct OperandStack {
    values: Vec<Operand>,
    /// Heights at which each enclosing control frame's operands begin.
    limits: Vec<usize>,
    max_height: usize,
}

impl OperandStack {
    pub(crate) fn push(&mut self, operand: impl Into<Operand>) {
        self.values.push(operand.into());
        self.max_height = self.max_height.max(self.values.len());
    }

    pub(crate) fn push_all(&mut self, types: &[ValType]) {
        for &ty in types {
            self.push(ty);
        }
    }

    pub(crate) fn max_height(&self) -> usize {
        self.max_height
    }

    fn limit(&self) -> usize {
        self.limits.last().copied().unwrap_or(0)
    }

    /// Pops the top operand without crossing the current frame's base.
    ///
    /// An `Unknown` sitting directly on the base is never consumed: popping
    /// it again yields another `Unknown`.
    pub(crate) fn try_pop(&mut self) -> Option<Operand> {
        let limit = self.limit();
        let len = self.values.len();
        if len <= limit {
            None
        } else if len == limit + 1 && self.values[limit] == Operand::Unknown {
            Some(Operand::Unknown)
        } else {
            self.values.pop()
        }
    }

    pub(crate) fn pop(&mut self) -> Result<Operand, String> {
        self.try_pop().ok_or_else(|| {
            format!(
                "invalid operation: trying to pop at {} with limit {}",
                self.values.len(),
                self.limit()
            )
        })
    }

    pub(crate) fn pop_expect(&mut self, expected: ValType) -> Result<(), String> {
        let have = self
            .try_pop()
            .ok_or_else(|| format!("{expected} missing"))?;
        if !have.matches(expected.into()) {
            return Err(format!(
                "type mismatch: expected {expected}, but was {have}"
            ));
        }
        Ok(())
    }

    /// Truncates to the current frame's base and marks the remainder of the
    /// frame as polymorphic.
    pub(crate) fn unreachable(&mut self) {
        self.reset_at_limit();
        self.values.push(Operand::Unknown);
    }

    pub(crate) fn reset_at_limit(&mut self) {
        let limit = self.limit();
        self.values.truncate(limit);
    }

    /// Opens a new frame whose base sits below its `params` operands.
    pub(crate) fn push_limit(&mut self, params: usize) {
        let base = self.values.len().saturating_sub(params);
        self.limits.push(base);
    }

    pub(crate) fn pop_limit(&mut self) {
        self.limits.pop();
    }

    /// Pops `want` off the stack, checking the count and types.
    ///
    /// With `check_above_limit`, the frame must hold exactly `want` and
    /// nothing else.
    pub(crate) fn require(
        &mut self,
        is_param: bool,
        context: &str,
        want: &[ValType],
        check_above_limit: bool,
    ) -> Result<(), String> {
        let mut popped: SmallVec<[Operand; 8]> = SmallVec::new();
        for _ in 0..want.len() {
            match self.try_pop() {
                Some(operand) => popped.push(operand),
                None => {
                    popped.reverse();
                    return Err(type_count_error(is_param, context, &popped, want));
                }
            }
        }
        if check_above_limit {
            let limit = self.limit();
            let len = self.values.len();
            let exact = len == limit || (len == limit + 1 && self.values[limit] == Operand::Unknown);
            if !exact {
                let mut have: Vec<Operand> = self.values[limit..].to_vec();
                have.extend(popped.iter().rev());
                return Err(type_count_error(is_param, context, &have, want));
            }
        }
        for (i, have) in popped.iter().enumerate() {
            let index = want.len() - i - 1;
            let want_ty = want[index];
            if !have.matches(want_ty.into()) {
                return Err(type_mismatch_error(is_param, context, *have, want_ty, index));
            }
        }
        Ok(())
    }
}
