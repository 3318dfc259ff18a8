//! Entry points of the shared-memory runtime library. Handles cross the
//! boundary as opaque pointers.

use contra_ast::{ContraError, Span};
use contra_ir::{Builder, Type, ValueId};

pub const RUNTIME_START: &str = "contra_kokkos_runtime_start";
pub const RUNTIME_STOP: &str = "contra_kokkos_runtime_stop";

pub const FIELD_CREATE: &str = "contra_kokkos_field_create";
pub const FIELD_CREATE_FROM_RANGE: &str = "contra_kokkos_field_create_from_range";
pub const FIELD_DESTROY: &str = "contra_kokkos_field_destroy";

pub const PARTITION_FROM_SIZE: &str = "contra_kokkos_partition_from_size";
pub const PARTITION_FROM_ARRAY: &str = "contra_kokkos_partition_from_array";
pub const PARTITION_DESTROY: &str = "contra_kokkos_partition_destroy";
pub const PARTITION_PIECE: &str = "contra_kokkos_partition_piece";

pub const ACCESSOR_CREATE: &str = "contra_kokkos_accessor_create";
pub const ACCESSOR_READ: &str = "contra_kokkos_accessor_read";
pub const ACCESSOR_WRITE: &str = "contra_kokkos_accessor_write";
pub const ACCESSOR_DESTROY: &str = "contra_kokkos_accessor_destroy";

pub const PARALLEL_FOR: &str = "contra_kokkos_parallel_for";
pub const PARALLEL_REDUCE: &str = "contra_kokkos_parallel_reduce";

fn signature(name: &str) -> Option<(Vec<Type>, Type, bool)> {
    let opaque = Type::void_ptr;
    let sig = match name {
        // argc, then argc strings
        RUNTIME_START => (vec![Type::I64], Type::Void, true),
        RUNTIME_STOP => (Vec::new(), Type::Void, false),
        // name, element bytes, init value, extent, out
        FIELD_CREATE => (
            vec![Type::Str, Type::I64, opaque(), Type::I64, opaque()],
            Type::Void,
            false,
        ),
        FIELD_CREATE_FROM_RANGE => (
            vec![Type::Str, Type::I64, opaque(), opaque(), opaque()],
            Type::Void,
            false,
        ),
        FIELD_DESTROY | PARTITION_DESTROY | ACCESSOR_DESTROY => {
            (vec![opaque()], Type::Void, false)
        }
        PARTITION_FROM_SIZE => (vec![Type::I64, opaque(), opaque()], Type::Void, false),
        PARTITION_FROM_ARRAY => (vec![opaque(), opaque(), opaque()], Type::Void, false),
        // partition, point, out range
        PARTITION_PIECE => (vec![opaque(), Type::I64, opaque()], Type::Void, false),
        // field, partition or null, out
        ACCESSOR_CREATE => (vec![opaque(), opaque(), opaque()], Type::Void, false),
        ACCESSOR_READ | ACCESSOR_WRITE => (vec![opaque(), Type::I64, opaque()], Type::Void, false),
        // label, kernel, range, argc, args...
        PARALLEL_FOR => (
            vec![Type::Str, opaque(), opaque(), Type::I64],
            Type::Void,
            true,
        ),
        // label, kernel, range, reduction op, combiner or null, result, argc, args...
        PARALLEL_REDUCE => (
            vec![
                Type::Str,
                opaque(),
                opaque(),
                Type::I64,
                opaque(),
                opaque(),
                Type::I64,
            ],
            Type::Void,
            true,
        ),
        _ => return None,
    };
    Some(sig)
}

/// Calls a runtime entry point, declaring it on first use.
pub fn call(b: &mut Builder, name: &str, args: Vec<ValueId>, span: Span) -> Result<Option<ValueId>, ContraError> {
    if !b.has_callable(name) {
        let Some((params, ret, variadic)) = signature(name) else {
            return Err(ContraError::implementation(
                format!("unknown runtime function '{name}'"),
                span,
            ));
        };
        b.declare_extern(name, params, ret, variadic)?;
    }
    Ok(b.call(name, args)?)
}
