use nanoid::nanoid;

/// 生成 Binding 的短名字 (NanoID)
///
/// 只用于日志里区分不同的 Binding，不参与任何逻辑判断。
#[inline]
pub fn new_binding_name() -> String {
    // 不包含 - 和 _ ，日志里双击即可选中
    const ALPHABET: [char; 62] = [
        '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h',
        'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
        'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R',
        'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z',
    ];
    nanoid!(5, &ALPHABET)
}

/// 从 `catch_unwind` 的载荷里取出 panic 信息
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("Panic: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("Panic: {}", s)
    } else {
        "Panic: Unknown error".to_string()
    }
}
