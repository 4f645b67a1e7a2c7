diesel::table! {
    products (id) {
        id -> Uuid,
        name -> Varchar,
        slug -> Varchar,
        description -> Text,
        brand -> Varchar,
        base_price -> Numeric,
        has_variants -> Bool,
        is_active -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    variants (id) {
        id -> Uuid,
        product_id -> Uuid,
        sku -> Varchar,
        price -> Nullable<Numeric>,
        stock_quantity -> Int4,
        is_active -> Bool,
    }
}

diesel::table! {
    orders (id) {
        id -> Uuid,
        order_number -> Varchar,
        status -> Varchar,
        payment_status -> Varchar,
        user_email -> Varchar,
        subtotal -> Numeric,
        shipping_cost -> Numeric,
        tax -> Numeric,
        discount -> Numeric,
        total -> Numeric,
        inventory_applied -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    order_items (id) {
        id -> Uuid,
        order_id -> Uuid,
        product_id -> Uuid,
        variant_id -> Nullable<Uuid>,
        product_name -> Varchar,
        sku -> Varchar,
        unit_price -> Numeric,
        quantity -> Int4,
    }
}

diesel::joinable!(variants -> products (product_id));
diesel::joinable!(order_items -> orders (order_id));

diesel::allow_tables_to_appear_in_same_query!(
    products,
    variants,
    orders,
    order_items,
);
