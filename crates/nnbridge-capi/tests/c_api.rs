//! Drives the exported `nn_*` functions the way a C host would.

use std::ffi::{c_void, CStr, CString};
use std::io::Write;
use std::os::raw::c_char;
use std::ptr;

use nnbridge_capi::*;
use pretty_assertions::assert_eq;

const MODEL: &str = r#"{
    "version": "2.0", "biz_code": "capi", "uuid": "c-1",
    "inputs": [{"name": "input", "shape": [1, 4]}],
    "ops": [
        {"name": "scale", "type": "Scale", "inputs": ["input"], "outputs": ["scaled"], "scale": 2.0, "bias": 1.0},
        {"name": "act", "type": "ReLU", "inputs": ["scaled"], "outputs": ["act"]},
        {"name": "mix", "type": "Add", "inputs": ["act", "input"], "outputs": ["output"]}
    ],
    "outputs": ["output"]
}"#;

fn model_file() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(MODEL.as_bytes()).unwrap();
    file
}

fn cpu_config() -> ScheduleConfigC {
    ScheduleConfigC {
        num_thread: 1,
        ..Default::default()
    }
}

fn interpreter() -> Handle {
    let interp = nn_interpreter_from_buffer(MODEL.as_ptr(), MODEL.len());
    assert!(!interp.is_null());
    interp
}

fn fill_input(session: Handle, values: &[f32]) {
    let input = nn_session_get_input(session, ptr::null());
    assert!(!input.is_null());
    let host = nn_tensor_host(input) as *mut f32;
    assert!(!host.is_null());
    unsafe { std::slice::from_raw_parts_mut(host, values.len()) }.copy_from_slice(values);
}

fn cstr(ptr: *const c_char) -> String {
    unsafe { CStr::from_ptr(ptr) }.to_str().unwrap().to_string()
}

#[test]
fn missing_model_file_gives_null_handle() {
    let path = CString::new("/tmp/nnbridge-capi-missing-model.json").unwrap();
    assert!(nn_interpreter_from_file(path.as_ptr()).is_null());
    assert!(nn_interpreter_from_file(ptr::null()).is_null());
}

#[test]
fn file_model_runs_end_to_end() {
    let file = model_file();
    let path = CString::new(file.path().to_str().unwrap()).unwrap();
    let interp = nn_interpreter_from_file(path.as_ptr());
    assert!(!interp.is_null());
    assert_eq!(cstr(nn_interpreter_model_version(interp)), "2.0");
    assert_eq!(cstr(nn_interpreter_biz_code(interp)), "capi");
    assert_eq!(cstr(nn_interpreter_uuid(interp)), "c-1");

    let config = cpu_config();
    let session = nn_session_create(interp, &config);
    assert!(!session.is_null());
    fill_input(session, &[-1.0, 0.0, 1.0, 2.0]);

    assert_eq!(nn_session_run(session), ErrorCode::NoExecution);
    assert_eq!(nn_session_resize(session), ErrorCode::NoError);
    assert_eq!(nn_session_run(session), ErrorCode::NoError);

    let name = CString::new("output").unwrap();
    let output = nn_session_get_output(session, name.as_ptr());
    assert!(!output.is_null());
    assert_eq!(nn_tensor_dimensions(output), 2);
    let values = unsafe { std::slice::from_raw_parts(nn_tensor_host(output) as *const f32, 4) };
    // relu(2x + 1) + x
    assert_eq!(values, &[-1.0, 1.0, 4.0, 7.0]);

    let mut threads = 0i32;
    assert!(nn_session_get_info(
        session,
        SESSION_INFO_THREAD_NUMBER,
        &mut threads as *mut i32 as *mut c_void
    ));
    assert_eq!(threads, 1);

    assert!(nn_interpreter_free(interp));
}

#[test]
fn borrowed_lookups_return_identical_handles() {
    let interp = interpreter();
    let session = nn_session_create(interp, &cpu_config());
    let first = nn_session_get_input(session, ptr::null());
    let name = CString::new("input").unwrap();
    let named = nn_session_get_input(session, name.as_ptr());
    assert_eq!(first, named);
    assert_eq!(nn_session_get_input(session, ptr::null()), first);

    // borrowed tensors belong to the session
    assert!(!nn_tensor_free(first));
    assert_eq!(nn_tensor_size(first), 16);

    let missing = CString::new("nope").unwrap();
    assert!(nn_session_get_output(session, missing.as_ptr()).is_null());
    nn_interpreter_free(interp);
}

#[test]
fn named_list_free_leaves_handles_valid() {
    let interp = interpreter();
    let session = nn_session_create(interp, &cpu_config());
    assert_eq!(nn_session_resize(session), ErrorCode::NoError);

    let list = nn_session_get_output_all(session);
    assert_eq!(list.count, 1);
    let entry = unsafe { *list.entries };
    assert_eq!(cstr(entry.name), "output");
    let handle = entry.handle;
    nn_named_tensor_list_free(list);

    assert_eq!(nn_tensor_dimensions(handle), 2);
    assert_eq!(nn_session_get_output(session, ptr::null()), handle);
    assert!(!nn_tensor_free(handle));

    assert!(nn_session_release(session));
    assert_eq!(nn_tensor_dimensions(handle), -1);
    nn_interpreter_free(interp);
}

#[test]
fn retained_tensor_list_skips_null_entries() {
    let interp = interpreter();
    let scaled = CString::new("scaled").unwrap();
    let act = CString::new("act").unwrap();
    let names: [*const c_char; 4] = [ptr::null(), scaled.as_ptr(), ptr::null(), act.as_ptr()];
    let config = ScheduleConfigC {
        save_tensors: StringArrayC {
            data: names.as_ptr(),
            size: names.len(),
        },
        ..cpu_config()
    };
    let session = nn_session_create(interp, &config);
    assert!(!session.is_null());

    let outputs = nn_session_output_names(session);
    let names: Vec<String> = unsafe { std::slice::from_raw_parts(outputs.data, outputs.size) }
        .iter()
        .map(|&p| cstr(p))
        .collect();
    assert_eq!(names, vec!["output", "scaled", "act"]);
    nn_string_array_free(outputs);
    nn_interpreter_free(interp);
}

#[test]
fn op_path_without_inputs_is_rejected() {
    let interp = interpreter();
    let mix = CString::new("mix").unwrap();
    let outputs = [mix.as_ptr()];
    let config = ScheduleConfigC {
        path: SchedulePathC {
            inputs: StringArrayC::empty(),
            outputs: StringArrayC {
                data: outputs.as_ptr(),
                size: 1,
            },
            mode: 0,
        },
        ..cpu_config()
    };
    assert!(nn_session_create(interp, &config).is_null());
    assert_eq!(nn_interpreter_session_count(interp), 0);

    let configs = [cpu_config(), config];
    assert!(nn_session_create_multi_path(interp, configs.as_ptr(), configs.len()).is_null());
    assert!(nn_session_create_multi_path(interp, configs.as_ptr(), 0).is_null());
    nn_interpreter_free(interp);
}

#[derive(Default)]
struct Counts {
    before: Vec<(String, usize)>,
    after: Vec<(String, usize)>,
    null_names: usize,
}

unsafe extern "C" fn count_before(tensors: *const Handle, count: usize, name: *const c_char, user: *mut c_void) -> i32 {
    let counts = unsafe { &mut *(user as *mut Counts) };
    if name.is_null() || (count > 0 && tensors.is_null()) {
        counts.null_names += 1;
    } else {
        counts.before.push((cstr(name), count));
    }
    1
}

unsafe extern "C" fn count_after(tensors: *const Handle, count: usize, name: *const c_char, user: *mut c_void) -> i32 {
    let counts = unsafe { &mut *(user as *mut Counts) };
    if name.is_null() || (count > 0 && tensors.is_null()) {
        counts.null_names += 1;
    } else {
        counts.after.push((cstr(name), count));
    }
    1
}

#[test]
fn callbacks_fire_once_per_operator() {
    let interp = interpreter();
    let session = nn_session_create(interp, &cpu_config());
    assert_eq!(nn_session_resize(session), ErrorCode::NoError);

    let mut counts = Counts::default();
    let code = nn_session_run_with_callback(
        session,
        Some(count_before),
        Some(count_after),
        true,
        &mut counts as *mut Counts as *mut c_void,
    );
    assert_eq!(code, ErrorCode::NoError);
    assert_eq!(counts.null_names, 0);
    assert_eq!(
        counts.before,
        vec![("scale".to_string(), 1), ("act".to_string(), 1), ("mix".to_string(), 2)]
    );
    assert_eq!(
        counts.after,
        vec![("scale".to_string(), 1), ("act".to_string(), 1), ("mix".to_string(), 1)]
    );
    nn_interpreter_free(interp);
}

unsafe extern "C" fn info_before(_: *const Handle, _: usize, info: *const OperatorInfoC, user: *mut c_void) -> i32 {
    let seen = unsafe { &mut *(user as *mut Vec<String>) };
    let info = unsafe { &*info };
    seen.push(format!("{}:{}", cstr(info.name), cstr(info.op_type)));
    1
}

unsafe extern "C" fn stop_after(_: *const Handle, _: usize, _: *const OperatorInfoC, _: *mut c_void) -> i32 {
    0
}

#[test]
fn info_callbacks_carry_operator_type_and_can_stop() {
    let interp = interpreter();
    let session = nn_session_create(interp, &cpu_config());
    assert_eq!(nn_session_resize(session), ErrorCode::NoError);

    let mut seen: Vec<String> = Vec::new();
    let code = nn_session_run_with_callback_info(
        session,
        Some(info_before),
        None,
        true,
        &mut seen as *mut Vec<String> as *mut c_void,
    );
    assert_eq!(code, ErrorCode::NoError);
    assert_eq!(seen, vec!["scale:Scale", "act:ReLU", "mix:Add"]);

    let code = nn_session_run_with_callback_info(session, None, Some(stop_after), true, ptr::null_mut());
    assert_eq!(code, ErrorCode::CallbackStop);
    nn_interpreter_free(interp);
}

#[test]
fn runtime_manager_sets_thread_count() {
    let interp = interpreter();
    let runtime = nn_runtime_manager_create(ForwardType::Cpu as i32, 3);
    let session = nn_session_create_with_runtime(interp, &cpu_config(), runtime);
    assert!(!session.is_null());

    let mut threads = 0i32;
    assert!(nn_session_get_info(
        session,
        SESSION_INFO_THREAD_NUMBER,
        &mut threads as *mut i32 as *mut c_void
    ));
    assert_eq!(threads, 3);

    // the session keeps its settings after the runtime is gone
    assert!(nn_runtime_free(runtime));
    assert_eq!(nn_session_resize(session), ErrorCode::NoError);
    nn_interpreter_free(interp);
}

#[test]
fn resize_tensor_then_run() {
    let interp = interpreter();
    let session = nn_session_create(interp, &cpu_config());
    let input = nn_session_get_input(session, ptr::null());
    let dims = [2, 4];
    assert_eq!(nn_interpreter_resize_tensor(interp, input, dims.as_ptr(), 2), ErrorCode::NoError);
    assert_eq!(nn_session_resize(session), ErrorCode::NoError);
    fill_input(session, &[1.0; 8]);
    assert_eq!(nn_session_run(session), ErrorCode::NoError);

    let output = nn_session_get_output(session, ptr::null());
    let shape = nn_tensor_shape(output);
    assert_eq!(unsafe { std::slice::from_raw_parts(shape.data, shape.len) }, &dims);
    nn_tensor_shape_free(shape);
    nn_interpreter_free(interp);
}

#[test]
fn oversized_resize_reports_out_of_memory() {
    let interp = interpreter();
    let session = nn_session_create(interp, &cpu_config());
    let input = nn_session_get_input(session, ptr::null());

    let dims = [i32::MAX; 8];
    assert_eq!(nn_interpreter_resize_tensor(interp, input, dims.as_ptr(), 8), ErrorCode::OutOfMemory);
    assert_eq!(
        nn_interpreter_resize_tensor_4d(interp, input, i32::MAX, i32::MAX, i32::MAX, i32::MAX),
        ErrorCode::OutOfMemory
    );

    let shape = nn_tensor_shape(input);
    assert_eq!(unsafe { std::slice::from_raw_parts(shape.data, shape.len) }, &[1, 4]);
    nn_tensor_shape_free(shape);

    assert_eq!(nn_session_resize(session), ErrorCode::NoError);
    fill_input(session, &[1.0, 2.0, 3.0, 4.0]);
    assert_eq!(nn_session_run(session), ErrorCode::NoError);
    nn_interpreter_free(interp);
}

#[test]
fn oversized_device_tensor_gives_null_handle() {
    let shape = [1 << 20, 1 << 20, 16];
    let tensor = nn_tensor_create_device(shape.as_ptr(), 3, TypeTag::F32, DimensionType::Caffe as i32);
    assert!(tensor.is_null());
}

#[test]
fn host_tensor_copies_into_session_input() {
    let interp = interpreter();
    let session = nn_session_create(interp, &cpu_config());
    let input = nn_session_get_input(session, ptr::null());

    let values = [1.0f32, 2.0, 3.0, 4.0];
    let shape = [1, 4];
    let host = nn_tensor_create_host(
        shape.as_ptr(),
        2,
        TypeTag::F32,
        values.as_ptr() as *const c_void,
        16,
        DimensionType::Caffe as i32,
    );
    assert!(nn_tensor_copy_from_host(input, host));
    assert_eq!(nn_session_resize(session), ErrorCode::NoError);
    assert_eq!(nn_session_run(session), ErrorCode::NoError);

    let output = nn_session_get_output(session, ptr::null());
    let result = nn_tensor_create_host_from_device(output, true);
    let out = unsafe { std::slice::from_raw_parts(nn_tensor_host(result) as *const f32, 4) };
    assert_eq!(out, &[4.0, 7.0, 10.0, 13.0]);

    assert!(nn_tensor_free(host));
    assert!(nn_tensor_free(result));
    nn_interpreter_free(interp);
}
