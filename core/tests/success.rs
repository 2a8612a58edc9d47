//! Integration tests over the emitted assembly. Each test compiles a small
//! program and checks the listing for the expected instructions, sections,
//! and labels.

use clx::{compile, CompileOptions};

fn assemble(src: &str) -> String {
    match compile(src, "test.cx", &CompileOptions::default()) {
        Ok(output) => output.assembly,
        Err(errors) => panic!("compilation failed:\n{}", errors),
    }
}

fn assemble_optimized(src: &str) -> String {
    let options = CompileOptions {
        optimize: true,
        omit_frame_pointer: false,
    };
    match compile(src, "test.cx", &options) {
        Ok(output) => output.assembly,
        Err(errors) => panic!("compilation failed:\n{}", errors),
    }
}

fn assert_contains(asm: &str, needles: &[&str]) {
    for needle in needles {
        assert!(
            asm.contains(needle),
            "missing {:?} in assembly:\n{}",
            needle,
            asm
        );
    }
}

#[test]
fn test_integer_expression() {
    let asm = assemble(
        "global int main() { int a; a = 1 + 2 * 3; return a; }",
    );
    assert_contains(
        &asm,
        &[
            "global main",
            "main:",
            "push ebp",
            "mov ebp, esp",
            "sub esp, 4",
            "mov eax, 2",
            "mov ebx, 3",
            "mul ebx",
            "add eax, ebx",
            "mov dword[ebp - 4], eax",
            "jmp ._exit_main",
            "._exit_main:",
            "mov esp, ebp",
            "pop ebp",
            "ret",
        ],
    );
    // nothing initialized, nothing reserved
    assert!(!asm.contains("section .data"));
    assert!(!asm.contains("section .bss"));
}

#[test]
fn test_float_expression() {
    let asm = assemble(
        "global int main() { float f; f = 1.5 + 2.5; return 0; }",
    );
    assert_contains(
        &asm,
        &[
            "section .data",
            "float_val1 dd 1.5",
            "float_val2 dd 2.5",
            "fld dword[float_val1]",
            "fld dword[float_val2]",
            "fadd st1",
            "fstp dword[ebp - 4]",
        ],
    );
}

#[test]
fn test_pointer_arithmetic_compiles() {
    let asm = assemble(
        "global int main() { int *p; int q; q = 0; p = p + 1; return q; }",
    );
    // the literal step is scaled by the word size
    assert_contains(&asm, &["mov ebx, 4", "add eax, ebx"]);
}

#[test]
fn test_record_access() {
    let asm = assemble(
        "record R { int x; } R *r; global int main() { r->x = 5; return 0; }",
    );
    assert_contains(
        &asm,
        &[
            "section .bss",
            "struc R",
            ".x resd 1",
            "endstruc",
            "mov eax, 5",
        ],
    );
}

#[test]
fn test_record_reservation_and_sizeof() {
    let asm = assemble(
        "record R { int x; char y; } R v; \
         global int main() { int a; a = sizeof(R); return a; }",
    );
    assert_contains(
        &asm,
        &[
            "struc R",
            ".y resb 1",
            ".x resd 1",
            "endstruc",
            "v resb 5",
            "mov eax, 5",
            "mov dword[ebp - 4], eax",
        ],
    );
}

#[test]
fn test_inline_asm_substitution() {
    let asm = assemble(
        "global int main() { int x; \
         asm { \"mov %0, %1\" [\"=a\"(x) : \"i\"(42)] } \
         return 0; }",
    );
    assert_contains(&asm, &["\nmov eax, 42\n"]);
}

#[test]
fn test_inline_asm_memory_operand() {
    let asm = assemble(
        "global int main() { int x; \
         asm { \"mov %0, 1\" [\"=m\"(x) : ] } \
         return 0; }",
    );
    assert_contains(&asm, &["\nmov dword[ebp - 4], 1\n"]);
}

#[test]
fn test_while_loop_labels() {
    let asm = assemble(
        "global int main() { int i; i = 0; \
         while (i < 10) { i = i + 1; } return i; }",
    );
    assert_contains(
        &asm,
        &[
            ".while_loop1:",
            "cmp dword[ebp - 4], 10",
            "jge .exit_while_loop1",
            "jmp .while_loop1",
            ".exit_while_loop1:",
        ],
    );
}

#[test]
fn test_break_jumps_to_loop_exit() {
    let asm = assemble(
        "global int main() { int i; i = 0; \
         while (i < 10) { break; } return i; }",
    );
    assert_contains(&asm, &["jmp .exit_while_loop1"]);
}

#[test]
fn test_for_loop() {
    let asm = assemble(
        "global int main() { int i; int total; total = 0; \
         for (i = 0; i < 4; i = i + 1) { total = total + i; } \
         return total; }",
    );
    assert_contains(
        &asm,
        &[
            ".for_loop1:",
            "cmp dword[ebp - 4], 4",
            "jge .exit_for_loop1",
            "jmp .for_loop1",
            ".exit_for_loop1:",
        ],
    );
}

#[test]
fn test_selection_labels() {
    let asm = assemble(
        "global int main() { int i; i = 0; \
         if (i < 3) { i = 1; } else { i = 2; } return i; }",
    );
    assert_contains(
        &asm,
        &[
            "cmp dword[ebp - 4], 3",
            "jl .if_label1",
            "jmp .else_label1",
            ".if_label1:",
            "jmp .exit_if1",
            ".else_label1:",
            ".exit_if1:",
        ],
    );
}

#[test]
fn test_goto_and_label() {
    let asm = assemble(
        "global int main() { int i; i = 0; \
         top: i = i + 1; \
         if (i < 3) { goto top; } \
         return i; }",
    );
    assert_contains(&asm, &[".top:", "jmp .top"]);
}

#[test]
fn test_function_call() {
    let asm = assemble(
        "extern int putchar(int c); \
         global int main() { putchar(65); return 0; }",
    );
    assert_contains(
        &asm,
        &[
            "extern putchar",
            "push eax",
            "call putchar",
            "add esp, 4",
        ],
    );
}

#[test]
fn test_call_args_push_right_to_left() {
    let asm = assemble(
        "extern int pair(int a, int b); \
         global int main() { pair(1, 2); return 0; }",
    );
    // the second argument's value lands in eax and pushes first
    let two = asm.find("mov eax, 2").expect("arg 2 evaluated");
    let one = asm.find("mov eax, 1").expect("arg 1 evaluated");
    assert!(two < one, "arguments must evaluate right to left:\n{}", asm);
    assert_contains(&asm, &["add esp, 8"]);
}

#[test]
fn test_global_initializer_goes_to_data() {
    let asm = assemble("int g; g = 42; global int main() { return g; }");
    assert_contains(&asm, &["section .data", "g dd 42", "dword[g]"]);
    assert!(!asm.contains("g resd"));
}

#[test]
fn test_uninitialized_global_goes_to_bss() {
    let asm =
        assemble("int g; global int main() { g = 1; return g; }");
    assert_contains(&asm, &["section .bss", "g resd 1"]);
}

#[test]
fn test_array_reservation_and_access() {
    let asm = assemble(
        "int arr[3]; global int main() { arr[0] = 7; arr[1] = 8; return 0; }",
    );
    assert_contains(
        &asm,
        &[
            "arr resd 3",
            "mov dword[arr], eax",
            "mov dword[arr + 4], eax",
        ],
    );
}

#[test]
fn test_array_variable_index() {
    let asm = assemble(
        "int arr[3]; global int main() { int i; i = 1; arr[i] = 9; return 0; }",
    );
    assert_contains(
        &asm,
        &[
            "xor ecx, ecx",
            "mov ecx, dword[ebp - 4]",
            "mov dword[arr + ecx * 4], eax",
        ],
    );
}

#[test]
fn test_array_initializer_flattens() {
    let asm = assemble(
        "int grid[2][2] = { { 1, 2 }, { 3, 4 } }; \
         global int main() { return 0; }",
    );
    assert_contains(&asm, &["grid dd 1, 2, 3, 4"]);
    assert!(!asm.contains("grid resd"));
}

#[test]
fn test_string_literal_interned() {
    let asm = assemble(
        "char *s; global int main() { s = \"hi\"; return 0; }",
    );
    assert_contains(
        &asm,
        &[
            "string_val1 db 0x68,0x69,0x00",
            "mov eax, string_val1",
        ],
    );
}

#[test]
fn test_string_interning_deduplicates() {
    let asm = assemble(
        "char *s; char *t; \
         global int main() { s = \"hi\"; t = \"hi\"; return 0; }",
    );
    assert!(!asm.contains("string_val2"), "duplicate intern:\n{}", asm);
}

#[test]
fn test_frame_layout_sums_local_sizes() {
    let asm = assemble(
        "global int main() { int a; char c; double d; a = 0; c = 'x'; d = 1.5; return a; }",
    );
    // 4 + 1 + 8 in declaration order
    assert_contains(
        &asm,
        &[
            "sub esp, 13",
            "; a = [ebp - 4], dword",
            "; c = [ebp - 5], byte",
            "; d = [ebp - 13], qword",
        ],
    );
}

#[test]
fn test_parameters_address_above_frame() {
    let asm = assemble(
        "global int add(int a, int b) { int r; r = a + b; return r; } \
         global int main() { return 0; }",
    );
    assert_contains(
        &asm,
        &[
            "; a = [ebp + 8], dword",
            "; b = [ebp + 12], dword",
            "dword[ebp + 8]",
            "dword[ebp + 12]",
        ],
    );
}

#[test]
fn test_strength_reduction_emits_shift() {
    let asm = assemble_optimized(
        "global int main() { int a; int b; b = 2; a = b * 8; return a; }",
    );
    assert_contains(&asm, &["shl eax, 3"]);
    assert!(!asm.contains("mul"), "multiply survived reduction:\n{}", asm);
}

#[test]
fn test_constant_folding_collapses_expression() {
    let asm = assemble_optimized(
        "global int main() { int a; a = 1 + 2 * 3; return a; }",
    );
    assert_contains(&asm, &["mov eax, 7"]);
    assert!(!asm.contains("mul ebx"), "unfolded multiply:\n{}", asm);
}

#[test]
fn test_dead_globals_dropped_from_bss() {
    let asm = assemble_optimized(
        "int unused; int used; global int main() { used = 1; return used; }",
    );
    assert!(!asm.contains("unused res"), "dead global kept:\n{}", asm);
    assert_contains(&asm, &["used resd 1"]);
}

#[test]
fn test_no_frameptr_option() {
    let options = CompileOptions {
        optimize: false,
        omit_frame_pointer: true,
    };
    let asm = compile(
        "global int main() { return 0; }",
        "test.cx",
        &options,
    )
    .unwrap()
    .assembly;
    assert!(!asm.contains("push ebp"));
    assert!(!asm.contains("mov ebp, esp"));
    assert_contains(&asm, &["main:", "ret"]);
}

#[test]
fn test_assembly_is_deterministic() {
    let src = "record R { int x; char y; } R *r; int g; g = 3; \
               extern int putchar(int c); \
               global int main() { int i; \
               for (i = 0; i < 3; i = i + 1) { putchar(65); } \
               r->x = g; return 0; }";
    let first = assemble(src);
    let second = assemble(src);
    assert_eq!(first, second);
}

#[test]
fn test_sections_come_in_order() {
    let asm = assemble(
        "int g; g = 1; int h; record R { int x; } \
         global int main() { h = g; return h; }",
    );
    let text = asm.find("section .text").expect("text section");
    let data = asm.find("section .data").expect("data section");
    let bss = asm.find("section .bss").expect("bss section");
    assert!(text < data && data < bss, "section order wrong:\n{}", asm);
}
