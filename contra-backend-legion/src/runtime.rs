//! Entry points of the distributed runtime library. Every handle crosses the
//! boundary as an opaque pointer; `ctx` and `runtime` are those the running
//! task was given, or null before the runtime has started.

use contra_ast::{ContraError, Span};
use contra_ir::{Builder, Type, ValueId};

pub const REGISTER_TASK: &str = "contra_legion_register_task";
pub const POSTREGISTER_TASK: &str = "contra_legion_postregister_task";
pub const SET_TOP_LEVEL_TASK: &str = "contra_legion_set_top_level_task_id";
pub const START: &str = "contra_legion_start";
pub const FINALIZE: &str = "contra_legion_finalize";

pub const UNPACK_ARG: &str = "contra_legion_unpack_arg";
pub const UNPACK_FUTURE: &str = "contra_legion_unpack_future";
pub const GET_ACCESSOR: &str = "contra_legion_get_accessor";
pub const GET_INDEX_POINT: &str = "contra_legion_get_index_point";
pub const TASK_POSTAMBLE: &str = "contra_legion_task_postamble";

pub const FUTURE_FROM_VALUE: &str = "contra_legion_future_from_value";
pub const FUTURE_COPY: &str = "contra_legion_future_copy";
pub const FUTURE_GET_RESULT: &str = "contra_legion_future_get_result";
pub const FUTURE_DESTROY: &str = "contra_legion_future_destroy";

pub const INDEX_SPACE_CREATE: &str = "contra_legion_index_space_create";
pub const INDEX_SPACE_SIZE: &str = "contra_legion_index_space_size";
pub const INDEX_SPACE_POINT: &str = "contra_legion_index_space_point";
pub const INDEX_SPACE_DESTROY: &str = "contra_legion_index_space_destroy";

pub const FIELD_CREATE: &str = "contra_legion_field_create";
pub const FIELD_CREATE_FROM_RANGE: &str = "contra_legion_field_create_from_range";
pub const FIELD_DESTROY: &str = "contra_legion_field_destroy";

pub const PARTITION_FROM_SIZE: &str = "contra_legion_partition_from_size";
pub const PARTITION_FROM_ARRAY: &str = "contra_legion_partition_from_array";
pub const PARTITION_DESTROY: &str = "contra_legion_partition_destroy";
pub const PARTITION_PIECE: &str = "contra_legion_partition_piece";

pub const ACCESSOR_READ: &str = "contra_legion_accessor_read";
pub const ACCESSOR_WRITE: &str = "contra_legion_accessor_write";
pub const ACCESSOR_DESTROY: &str = "contra_legion_accessor_destroy";

pub const LAUNCHER_CREATE: &str = "contra_legion_task_launcher_create";
pub const LAUNCHER_ADD_ARG: &str = "contra_legion_task_launcher_add_arg";
pub const LAUNCHER_ADD_FUTURE: &str = "contra_legion_task_launcher_add_future";
pub const LAUNCHER_ADD_REGION: &str = "contra_legion_task_launcher_add_region";
pub const LAUNCHER_DESTROY: &str = "contra_legion_task_launcher_destroy";
pub const EXECUTE_TASK: &str = "contra_legion_execute_task";
pub const EXECUTE_INDEX_TASK: &str = "contra_legion_execute_index_task";
pub const FUTURE_MAP_REDUCE: &str = "contra_legion_future_map_reduce";
pub const FUTURE_MAP_DESTROY: &str = "contra_legion_future_map_destroy";

fn signature(name: &str) -> Option<(Vec<Type>, Type, bool)> {
    let p = Type::void_ptr;
    let i = || Type::I64;
    let void = |params: Vec<Type>| (params, Type::Void, false);
    let sig = match name {
        // id, name, body, is index task
        REGISTER_TASK => void(vec![i(), Type::Str, p(), i()]),
        POSTREGISTER_TASK => void(vec![p(), p(), i(), Type::Str, p(), i()]),
        SET_TOP_LEVEL_TASK => void(vec![i()]),
        START => (vec![i()], Type::Void, true),
        FINALIZE => void(Vec::new()),

        // task, position, out
        UNPACK_ARG => void(vec![p(), i(), p()]),
        // task, future position, out, bytes; waits for the future
        UNPACK_FUTURE => void(vec![p(), i(), p(), i()]),
        // regions, region count, position, ctx, runtime, out
        GET_ACCESSOR => void(vec![p(), i(), i(), p(), p(), p()]),
        GET_INDEX_POINT => (vec![p()], i(), false),
        // runtime, ctx, result count, then (value, bytes) pairs
        TASK_POSTAMBLE => (vec![p(), p(), i()], Type::Void, true),

        // value, bytes, out
        FUTURE_FROM_VALUE => void(vec![p(), i(), p()]),
        FUTURE_COPY => void(vec![p(), p()]),
        FUTURE_GET_RESULT => void(vec![p(), p(), i()]),
        FUTURE_DESTROY | ACCESSOR_DESTROY | LAUNCHER_DESTROY | FUTURE_MAP_DESTROY => {
            void(vec![p()])
        }

        // ctx, runtime, name, start, inclusive end, step, out
        INDEX_SPACE_CREATE => void(vec![p(), p(), Type::Str, i(), i(), i(), p()]),
        INDEX_SPACE_SIZE => (vec![p()], i(), false),
        INDEX_SPACE_POINT => (vec![p(), i()], i(), false),
        INDEX_SPACE_DESTROY | FIELD_DESTROY | PARTITION_DESTROY => void(vec![p(), p(), p()]),

        // ctx, runtime, name, element bytes, init, extent, out
        FIELD_CREATE => void(vec![p(), p(), Type::Str, i(), p(), i(), p()]),
        FIELD_CREATE_FROM_RANGE => void(vec![p(), p(), Type::Str, i(), p(), p(), p()]),

        // ctx, runtime, colours, index space, out
        PARTITION_FROM_SIZE => void(vec![p(), p(), i(), p(), p()]),
        PARTITION_FROM_ARRAY => void(vec![p(), p(), p(), p(), p()]),
        // ctx, runtime, partition, colour, out index space
        PARTITION_PIECE => void(vec![p(), p(), p(), i(), p()]),

        ACCESSOR_READ | ACCESSOR_WRITE => void(vec![p(), i(), p()]),

        // task id, index space or null, out
        LAUNCHER_CREATE => void(vec![i(), p(), p()]),
        LAUNCHER_ADD_ARG => void(vec![p(), p(), i()]),
        LAUNCHER_ADD_FUTURE => void(vec![p(), p()]),
        // launcher, field, partition or null
        LAUNCHER_ADD_REGION => void(vec![p(), p(), p()]),
        // ctx, runtime, launcher, out future or future map
        EXECUTE_TASK | EXECUTE_INDEX_TASK => void(vec![p(), p(), p(), p()]),
        // ctx, runtime, future map, result position, op, combiner or null, out, bytes
        FUTURE_MAP_REDUCE => void(vec![p(), p(), p(), i(), i(), p(), p(), i()]),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_returning_entry_points() {
        for name in [INDEX_SPACE_SIZE, INDEX_SPACE_POINT, GET_INDEX_POINT] {
            let (_, ret, _) = signature(name).unwrap();
            assert_eq!(ret, Type::I64, "{name}");
        }
        let (params, _, variadic) = signature(TASK_POSTAMBLE).unwrap();
        assert!(variadic);
        assert_eq!(params.len(), 3);
    }
}
